//! In-process message bus.
//!
//! Commands sent by the manager are recorded on an [`InMemoryBus`] instead of
//! reaching real agents; notifications injected with
//! [`InMemoryBus::publish_to_manager`] reach the connected client's inbound
//! queue. Messages go through the envelope codec both ways, like they would
//! on a real broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dm_messages::{Message, MessageEnvelope, Notification};
use dm_model::InstancePath;
use tracing::{debug, info};
use uuid::Uuid;

use super::client::{
    InboundQueue, MessagingClient, MessagingClientFactory, MessagingConfiguration, MessagingError,
};

/// Messaging type of the in-memory backend.
pub const IN_MEMORY_TYPE: &str = "in-memory";

/// A command recorded by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub application: String,
    pub scope: InstancePath,
    pub message: Message,
}

/// Shared in-process bus.
#[derive(Default)]
pub struct InMemoryBus {
    sent: Mutex<Vec<SentMessage>>,
    fail_sends: AtomicBool,
    /// Id and inbound queue of the connected client.
    manager: Mutex<Option<(Uuid, InboundQueue)>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages sent to the agent of one scoped instance.
    pub fn sent_to(&self, application: &str, scope: &InstancePath) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.application == application && &m.scope == scope)
            .map(|m| m.message.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make every send fail until reset.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver an agent notification to the manager.
    pub fn publish_to_manager(&self, notification: Notification) -> Result<(), MessagingError> {
        let bytes = MessageEnvelope::new(notification.into()).encode()?;
        let message = MessageEnvelope::decode(&bytes)?.into_message();

        let manager = self.manager.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, inbound) = manager.as_ref().ok_or(MessagingError::NotConnected)?;
        inbound
            .send(message)
            .map_err(|_| MessagingError::Send("manager inbound queue closed".to_string()))
    }

    fn record(&self, sent: SentMessage) -> Result<(), MessagingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MessagingError::Send("in-memory bus configured to fail".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sent);
        Ok(())
    }

    fn attach(&self, client: Uuid, inbound: InboundQueue) {
        *self.manager.lock().unwrap_or_else(PoisonError::into_inner) = Some((client, inbound));
    }

    /// Detach `client`, unless a newer client took its place.
    fn detach(&self, client: Uuid) {
        let mut manager = self.manager.lock().unwrap_or_else(PoisonError::into_inner);
        if manager.as_ref().is_some_and(|(id, _)| *id == client) {
            *manager = None;
        }
    }
}

/// Client of an [`InMemoryBus`].
pub struct InMemoryClient {
    id: Uuid,
    messaging_type: String,
    bus: Arc<InMemoryBus>,
    inbound: InboundQueue,
    connected: AtomicBool,
    configuration: Mutex<MessagingConfiguration>,
}

impl InMemoryClient {
    pub fn new(messaging_type: &str, bus: Arc<InMemoryBus>, inbound: InboundQueue) -> Self {
        Self {
            id: Uuid::new_v4(),
            messaging_type: messaging_type.to_string(),
            bus,
            inbound,
            connected: AtomicBool::new(false),
            configuration: Mutex::new(MessagingConfiguration::new()),
        }
    }
}

#[async_trait]
impl MessagingClient for InMemoryClient {
    fn messaging_type(&self) -> &str {
        &self.messaging_type
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open_connection(&self) -> Result<(), MessagingError> {
        self.bus.attach(self.id, self.inbound.clone());
        self.connected.store(true, Ordering::SeqCst);
        info!(messaging_type = %self.messaging_type, "In-memory client connected");
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), MessagingError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.bus.detach(self.id);
            info!(messaging_type = %self.messaging_type, "In-memory client disconnected");
        }
        Ok(())
    }

    async fn send_to_agent(
        &self,
        application: &str,
        scope: &InstancePath,
        message: &Message,
    ) -> Result<(), MessagingError> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected);
        }

        let bytes = MessageEnvelope::new(message.clone()).encode()?;
        let message = MessageEnvelope::decode(&bytes)?.into_message();
        debug!(
            application = %application,
            scope = %scope,
            kind = message.kind(),
            "In-memory send"
        );

        self.bus.record(SentMessage {
            application: application.to_string(),
            scope: scope.clone(),
            message,
        })
    }

    fn configuration(&self) -> MessagingConfiguration {
        self.configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_configuration(
        &self,
        configuration: MessagingConfiguration,
    ) -> Result<(), MessagingError> {
        *self
            .configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = configuration;
        Ok(())
    }
}

/// Builds [`InMemoryClient`]s bound to one bus.
pub struct InMemoryClientFactory {
    messaging_type: String,
    bus: Arc<InMemoryBus>,
}

impl InMemoryClientFactory {
    pub fn new(bus: Arc<InMemoryBus>) -> Self {
        Self::with_type(bus, IN_MEMORY_TYPE)
    }

    /// A factory posing as another messaging type.
    pub fn with_type(bus: Arc<InMemoryBus>, messaging_type: &str) -> Self {
        Self {
            messaging_type: messaging_type.to_string(),
            bus,
        }
    }
}

impl MessagingClientFactory for InMemoryClientFactory {
    fn messaging_type(&self) -> &str {
        &self.messaging_type
    }

    fn create_client(&self, inbound: InboundQueue) -> Arc<dyn MessagingClient> {
        Arc::new(InMemoryClient::new(
            &self.messaging_type,
            self.bus.clone(),
            inbound,
        ))
    }
}
