//! Error types for message encoding.

use thiserror::Error;

/// Errors that can occur when encoding or decoding messages.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    /// The payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The envelope carries a version this crate does not understand.
    #[error("unsupported message version: {0}")]
    UnsupportedVersion(i32),
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Serialization(err.to_string())
    }
}
