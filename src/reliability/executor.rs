use std::future::Future;
use std::sync::Arc;

use dimse::audit::{AuditEvent, AuditEventKind, AuditSink, TracingAuditSink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CircuitBreakerRegistry, ErrorCategory, RetryPolicy};
use crate::error::{Result, TransferError};

/// Runs one logical operation under a retry policy and the destination's
/// circuit breaker. This is the only layer that retries.
pub struct RetryExecutor {
    policy: RetryPolicy,
    breakers: Arc<CircuitBreakerRegistry>,
    audit: Arc<dyn AuditSink>,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            policy,
            breakers,
            audit: Arc::new(TracingAuditSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Execute `operation` against `destination` (an `AE@host:port` key).
    ///
    /// The closure receives the 1-based attempt number and must open a fresh
    /// association each time; an aborted association is never reused.
    pub async fn execute<T, F, Fut>(&self, destination: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = dimse::Result<T>>,
    {
        let breaker = self.breakers.get(destination);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            // Dropping the permit on cancellation frees a half-open probe.
            let permit = breaker.try_acquire()?;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => {
                    permit.success();
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", destination, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let category = ErrorCategory::of(&error);
            if category.affects_destination_health() {
                permit.failure();
            } else {
                // The peer answered, so the destination itself is healthy.
                permit.success();
            }

            if !self.policy.is_retryable(category) {
                return Err(TransferError::NotRetryable {
                    category,
                    source: error,
                });
            }
            let Some(delay) = self.policy.delay_for(attempt) else {
                return Err(TransferError::RetryExhausted {
                    attempts: attempt,
                    last_error: error,
                    category,
                });
            };

            warn!(
                "Attempt {} against {} failed ({}): {}; retrying in {:?}",
                attempt, destination, category, error, delay
            );
            self.audit.record(AuditEvent::new(AuditEventKind::RetryAttempt {
                destination: destination.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            }));

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
