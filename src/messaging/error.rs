//! Error types for messaging operations

use crate::error::AppError;
use crate::messaging::events::EventKind;

/// Result type for messaging operations
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Connection to the broker could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Channel could not be opened or was closed underneath us
    #[error("Channel error: {0}")]
    Channel(String),

    /// Exchange, queue or binding declaration failed
    #[error("Topology declaration failed: {0}")]
    Topology(String),

    /// Publish failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Subscribe failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Acknowledgement (ack or nack) failed
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Message body could not be decoded into an event envelope
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No topology entry exists for the event kind
    #[error("No topology entry for event kind {0}")]
    UnknownEventKind(EventKind),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl MessagingError {
    /// Whether the error means the broker session is unusable and must be rebuilt
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionFailed(_) | MessagingError::Channel(_)
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::SerializationError(err.to_string())
    }
}

impl From<MessagingError> for AppError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::ConfigurationError(msg) => AppError::Configuration(msg),
            MessagingError::ConnectionFailed(msg) | MessagingError::Channel(msg) => {
                AppError::Network(msg)
            }
            _ => AppError::Internal(err.to_string()),
        }
    }
}
