//! Message envelope - the wrapper backends put on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Message, MessageError};

/// Current envelope schema version.
pub const MESSAGE_VERSION: i32 = 1;

/// A message plus the metadata needed to trace it across the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier of this transmission.
    pub message_id: Uuid,

    /// When the sender built the envelope.
    pub sent_at: DateTime<Utc>,

    /// Envelope schema version.
    pub version: i32,

    pub message: Message,
}

impl MessageEnvelope {
    /// Wraps a message with a fresh id and the current time.
    pub fn new(message: Message) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            sent_at: Utc::now(),
            version: MESSAGE_VERSION,
            message,
        }
    }

    /// Encodes the envelope as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes an envelope, rejecting unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.version != MESSAGE_VERSION {
            return Err(MessageError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, Heartbeat, Notification};
    use dm_model::InstancePath;

    #[test]
    fn test_decode_preserves_message() {
        let message = Message::from(Notification::Heartbeat(Heartbeat {
            application_name: "shop".to_string(),
            scoped_instance_path: InstancePath::parse("/vm").unwrap(),
            ip_address: Some("10.0.0.4".to_string()),
            model_required: true,
        }));
        let envelope = MessageEnvelope::new(message.clone());

        let decoded = MessageEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_id, envelope.message_id);
        assert_eq!(decoded.into_message(), message);
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let mut envelope = MessageEnvelope::new(Message::from(Command::Resynchronize));
        envelope.version = MESSAGE_VERSION + 1;
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let err = MessageEnvelope::decode(&bytes).unwrap_err();
        assert!(matches!(err, MessageError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = MessageEnvelope::decode(b"not json").unwrap_err();
        assert!(matches!(err, MessageError::Serialization(_)));
    }
}
