//! Error types for the communication core
//!
//! One crate-level error enum covers every failure surfaced by name in the
//! public API. Validation errors fail synchronously at the call site;
//! wire-level trouble is reported through the operating-state stream, never
//! per publish.

use thiserror::Error;

/// Main error type for communication core operations
#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("Invalid topic: {message}")]
    InvalidTopic { message: String },

    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Resubscribe forbidden: response sequence already terminated")]
    ResubscribeForbidden,

    #[error("Communication manager has been shut down")]
    ShutDown,

    #[error("Broker error: {0}")]
    Broker(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl CommunicationError {
    /// Create an InvalidTopic error
    pub fn invalid_topic<S: Into<String>>(message: S) -> Self {
        Self::InvalidTopic {
            message: message.into(),
        }
    }

    /// Create an InvalidPayload error
    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Create an InvalidOperation error
    pub fn invalid_operation<S: Into<String>>(message: S) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create an InvalidState error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a broker error from any underlying transport failure
    pub fn broker<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Broker(Box::new(err))
    }

    /// Create a broker error from a plain message
    pub fn broker_msg<S: Into<String>>(message: S) -> Self {
        Self::Broker(message.into().into())
    }
}

/// Result type for communication core operations
pub type CommunicationResult<T> = Result<T, CommunicationError>;
