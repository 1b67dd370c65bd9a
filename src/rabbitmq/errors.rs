// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    /// Startup gave up; the owning process must not continue.
    #[error("could not connect to RabbitMQ after {attempts} attempts")]
    ConnectionExhausted {
        attempts: u32,
        #[source]
        source: Box<RpcError>,
    },

    #[error("not connected to RabbitMQ")]
    NotConnected,

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RPC request timed out after {0:?}")]
    Timeout(Duration),

    #[error("RPC request was cancelled")]
    Cancelled,

    #[error("Reply consumer closed before a matching reply arrived")]
    ReplyStreamClosed,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Only an exhausted startup is fatal, everything else is recovered by callers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::ConnectionExhausted { .. })
    }
}

// Converting from lapin errors
impl From<LapinError> for RpcError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            RpcError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            RpcError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            RpcError::PublishError(error_text)
        } else if lowered.contains("consume") {
            RpcError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            RpcError::AckError(error_text)
        } else {
            RpcError::Unknown(error_text)
        }
    }
}

impl From<String> for RpcError {
    fn from(message: String) -> Self {
        RpcError::Unknown(message)
    }
}

impl From<&str> for RpcError {
    fn from(message: &str) -> Self {
        RpcError::Unknown(message.to_string())
    }
}
