//! Messaging client interfaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dm_messages::{Message, MessageError};
use dm_model::InstancePath;
use thiserror::Error;
use tokio::sync::mpsc;

/// Messaging type reported by [`DismissClient`].
pub const DISMISSED_TYPE: &str = "dismissed";

/// Queue feeding agent notifications to the message processor.
pub type InboundQueue = mpsc::UnboundedSender<Message>;

/// Backend-specific settings (broker URL, credentials, ...).
pub type MessagingConfiguration = BTreeMap<String, String>;

/// Errors from the messaging layer.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("messaging client is not connected")]
    NotConnected,

    #[error("no messaging factory registered for type '{0}'")]
    UnknownBackend(String),

    /// Configuration targeted a backend other than the active one.
    #[error("configured messaging type is '{configured}' but the active client is '{active}'")]
    TypeMismatch { configured: String, active: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Codec(#[from] MessageError),
}

/// A connection to one message bus.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    fn messaging_type(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn open_connection(&self) -> Result<(), MessagingError>;

    async fn close_connection(&self) -> Result<(), MessagingError>;

    /// Send a message to the agent of a scoped instance.
    async fn send_to_agent(
        &self,
        application: &str,
        scope: &InstancePath,
        message: &Message,
    ) -> Result<(), MessagingError>;

    fn configuration(&self) -> MessagingConfiguration;

    fn set_configuration(&self, configuration: MessagingConfiguration)
        -> Result<(), MessagingError>;
}

/// Builds clients of one messaging type.
pub trait MessagingClientFactory: Send + Sync {
    fn messaging_type(&self) -> &str;

    /// Create a client delivering agent notifications to `inbound`.
    fn create_client(&self, inbound: InboundQueue) -> Arc<dyn MessagingClient>;
}

/// Stand-in used while no real client can be built.
///
/// Never connected; every send fails with [`MessagingError::NotConnected`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DismissClient;

#[async_trait]
impl MessagingClient for DismissClient {
    fn messaging_type(&self) -> &str {
        DISMISSED_TYPE
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn open_connection(&self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn send_to_agent(
        &self,
        _application: &str,
        _scope: &InstancePath,
        _message: &Message,
    ) -> Result<(), MessagingError> {
        Err(MessagingError::NotConnected)
    }

    fn configuration(&self) -> MessagingConfiguration {
        MessagingConfiguration::new()
    }

    fn set_configuration(
        &self,
        _configuration: MessagingConfiguration,
    ) -> Result<(), MessagingError> {
        Err(MessagingError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_messages::Command;

    #[tokio::test]
    async fn test_dismiss_client_fails_sends() {
        let client = DismissClient;
        assert!(!client.is_connected());

        let result = client
            .send_to_agent(
                "app",
                &InstancePath::parse("/vm").unwrap(),
                &Command::Resynchronize.into(),
            )
            .await;
        assert!(matches!(result, Err(MessagingError::NotConnected)));
    }
}
