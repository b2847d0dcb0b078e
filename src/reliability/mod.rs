//! Reliability layer: error classification, retry policy, per-destination
//! circuit breakers and the retry executor combining them.

mod breaker;
mod category;
mod executor;
mod policy;

pub use breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use category::ErrorCategory;
pub use executor::RetryExecutor;
pub use policy::{BackoffStrategy, RetryPolicy};
