//! Error types for the transfer tier

use dimse::DimseError;
use thiserror::Error;
use uuid::Uuid;

use crate::reliability::ErrorCategory;

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Dimse(#[from] DimseError),

    #[error("Circuit open for {destination}")]
    CircuitOpen { destination: String },

    #[error("Gave up after {attempts} attempts ({category}): {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: DimseError,
        category: ErrorCategory,
    },

    #[error("Not retryable ({category}): {source}")]
    NotRetryable {
        category: ErrorCategory,
        source: DimseError,
    },

    #[error("Queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Transfer {0} expired before dispatch")]
    ItemExpired(Uuid),

    #[error("Transfer {0} was dropped to make room for a higher priority item")]
    Dropped(Uuid),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging initialisation failed: {0}")]
    Logging(String),
}

impl TransferError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Category of the underlying failure, where there is one
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Dimse(e) => Some(ErrorCategory::of(e)),
            Self::RetryExhausted { category, .. } | Self::NotRetryable { category, .. } => {
                Some(*category)
            }
            Self::CircuitOpen { .. } => Some(ErrorCategory::Transient),
            Self::QueueFull { .. } => Some(ErrorCategory::Resource),
            Self::Config(_) | Self::UnknownNode(_) => Some(ErrorCategory::Configuration),
            _ => None,
        }
    }
}
