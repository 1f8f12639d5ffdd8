//! Hot-swappable messaging client.
//!
//! The active client lives in an `ArcSwap`, so readers never wait for a
//! connect or a send in progress. Every change of the active client or of
//! the configured type goes through `switch_lock`. Replaced clients are
//! closed after the lock is released.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dm_messages::Message;
use dm_model::InstancePath;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::client::{
    DismissClient, InboundQueue, MessagingClient, MessagingClientFactory, MessagingConfiguration,
    MessagingError,
};
use super::registry::MessagingFactoryRegistry;

struct ActiveClient {
    /// Messaging type requested by the last switch.
    configured_type: Option<String>,
    client: Arc<dyn MessagingClient>,
    /// Type of the factory that built `client`; `None` when dismissed.
    backed_by: Option<String>,
}

impl ActiveClient {
    fn dismissed(configured_type: Option<String>) -> Self {
        Self {
            configured_type,
            client: Arc::new(DismissClient),
            backed_by: None,
        }
    }
}

/// Messaging gateway used by the rest of the manager.
pub struct ReconfigurableClient {
    factories: MessagingFactoryRegistry,
    inbound: InboundQueue,
    active: ArcSwap<ActiveClient>,
    switch_lock: Mutex<()>,
}

impl ReconfigurableClient {
    /// Create a dismissed gateway whose clients feed `inbound`.
    pub fn new(inbound: InboundQueue) -> Self {
        Self {
            factories: MessagingFactoryRegistry::new(),
            inbound,
            active: ArcSwap::from_pointee(ActiveClient::dismissed(None)),
            switch_lock: Mutex::new(()),
        }
    }

    /// The client currently in use. Never blocks.
    pub fn messaging_client(&self) -> Arc<dyn MessagingClient> {
        self.active.load().client.clone()
    }

    pub fn configured_type(&self) -> Option<String> {
        self.active.load().configured_type.clone()
    }

    /// True while no real client is active.
    pub fn is_dismissed(&self) -> bool {
        self.active.load().backed_by.is_none()
    }

    pub fn factories(&self) -> &MessagingFactoryRegistry {
        &self.factories
    }

    /// Build, connect and activate a client of `messaging_type`.
    ///
    /// Without a registered factory of that type the gateway stays dismissed
    /// until one registers. A client that fails to connect is not activated.
    pub async fn switch_backend(&self, messaging_type: &str) -> Result<(), MessagingError> {
        let (previous, result) = {
            let _lock = self.switch_lock.lock().await;
            let configured = Some(messaging_type.to_string());

            let (next, result) = match self.factories.get(messaging_type) {
                Some(factory) => match self.connect(&*factory).await {
                    Ok(client) => (
                        ActiveClient {
                            configured_type: configured,
                            client,
                            backed_by: Some(messaging_type.to_string()),
                        },
                        Ok(()),
                    ),
                    Err(e) => (ActiveClient::dismissed(configured), Err(e)),
                },
                None => {
                    warn!(
                        messaging_type = %messaging_type,
                        "No messaging factory registered, client dismissed until one is"
                    );
                    (ActiveClient::dismissed(configured), Ok(()))
                }
            };

            (self.active.swap(Arc::new(next)), result)
        };

        Self::close_replaced(previous).await;
        if result.is_ok() {
            info!(messaging_type = %messaging_type, "Messaging backend switched");
        }
        result
    }

    /// Make a factory available.
    ///
    /// When it matches the configured type and the gateway is dismissed, a
    /// client is built and activated right away.
    pub async fn register_factory(
        &self,
        factory: Arc<dyn MessagingClientFactory>,
    ) -> Result<(), MessagingError> {
        let messaging_type = factory.messaging_type().to_string();
        self.factories.register(factory.clone());
        info!(messaging_type = %messaging_type, "Messaging factory registered");

        let previous = {
            let _lock = self.switch_lock.lock().await;
            let current = self.active.load_full();
            if current.backed_by.is_some()
                || current.configured_type.as_deref() != Some(messaging_type.as_str())
            {
                return Ok(());
            }

            let client = self.connect(&*factory).await?;
            self.active.swap(Arc::new(ActiveClient {
                configured_type: current.configured_type.clone(),
                client,
                backed_by: Some(messaging_type.clone()),
            }))
        };

        Self::close_replaced(previous).await;
        info!(messaging_type = %messaging_type, "Messaging client activated");
        Ok(())
    }

    /// Withdraw a factory. A client it built is closed and dismissed.
    pub async fn deregister_factory(&self, messaging_type: &str) {
        if self.factories.unregister(messaging_type).is_some() {
            info!(messaging_type = %messaging_type, "Messaging factory deregistered");
        }

        let previous = {
            let _lock = self.switch_lock.lock().await;
            let current = self.active.load_full();
            if current.backed_by.as_deref() != Some(messaging_type) {
                return;
            }
            self.active.swap(Arc::new(ActiveClient::dismissed(
                current.configured_type.clone(),
            )))
        };

        warn!(messaging_type = %messaging_type, "Active messaging client dismissed");
        Self::close_replaced(previous).await;
    }

    /// Configuration of the active client, if it is of the configured type.
    pub fn configuration(&self) -> Option<MessagingConfiguration> {
        let current = self.active.load();
        let configured = current.configured_type.as_deref()?;
        (current.client.messaging_type() == configured).then(|| current.client.configuration())
    }

    /// Configure the active client, if it is of the configured type.
    pub fn set_configuration(
        &self,
        configuration: MessagingConfiguration,
    ) -> Result<(), MessagingError> {
        let current = self.active.load();
        let configured = current.configured_type.as_deref().unwrap_or_default();
        let active = current.client.messaging_type();
        if active != configured {
            return Err(MessagingError::TypeMismatch {
                configured: configured.to_string(),
                active: active.to_string(),
            });
        }
        current.client.set_configuration(configuration)
    }

    pub async fn send_to_agent(
        &self,
        application: &str,
        scope: &InstancePath,
        message: &Message,
    ) -> Result<(), MessagingError> {
        let client = self.messaging_client();
        client.send_to_agent(application, scope, message).await
    }

    /// Close the active client and dismiss it.
    pub async fn close(&self) {
        let previous = {
            let _lock = self.switch_lock.lock().await;
            let configured = self.active.load().configured_type.clone();
            self.active.swap(Arc::new(ActiveClient::dismissed(configured)))
        };
        Self::close_replaced(previous).await;
    }

    async fn connect(
        &self,
        factory: &dyn MessagingClientFactory,
    ) -> Result<Arc<dyn MessagingClient>, MessagingError> {
        let client = factory.create_client(self.inbound.clone());
        client.open_connection().await?;
        Ok(client)
    }

    async fn close_replaced(previous: Arc<ActiveClient>) {
        if previous.backed_by.is_none() {
            return;
        }
        if let Err(e) = previous.client.close_connection().await {
            warn!(
                messaging_type = %previous.client.messaging_type(),
                error = %e,
                "Failed to close replaced messaging client"
            );
        }
    }
}
