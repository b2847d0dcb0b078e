//! Scheduling and reliability for DIMSE transfers
//!
//! Transfers are queued by priority in a [`TransferQueue`], then dispatched
//! by a [`TransferDispatcher`] which runs each one on its own association
//! through the [`RetryExecutor`], guarded by a per-destination circuit breaker.
//! The protocol itself lives in the `dimse` crate.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod queue;
pub mod reliability;

pub use config::{Config, LoggingConfig};
pub use dispatcher::{
    DispatcherConfig, OperationRunner, ScuRunner, TransferDispatcher, TransferOperation,
    TransferOutput, TransferRequest, TransferResult,
};
pub use error::{Result, TransferError};
pub use queue::{
    PrioritizedTransferItem, QueueConfig, QueueEvent, QueueStats, TransferPriority, TransferQueue,
};
pub use reliability::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    ErrorCategory, RetryExecutor, RetryPolicy,
};

pub use dimse;
