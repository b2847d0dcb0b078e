use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use dimse::RemoteNode;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker fails fast before letting a probe through
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(TransferError::config(
                "circuit_breaker.failure_threshold must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    reopen_at: Option<Instant>,
    probe_in_flight: bool,
    probe_id: u64,
}

/// Circuit breaker guarding one destination
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            destination: destination.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                reopen_at: None,
                probe_in_flight: false,
                probe_id: 0,
            }),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, moving an open breaker to half-open once its
    /// cooldown has passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner.reopen_at.is_some_and(|at| Instant::now() >= at)
        {
            info!("Circuit for {} is half-open", self.destination);
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }

    /// Ask permission for one attempt. Half-open admits a single probe
    /// until its outcome is recorded or its permit is dropped.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit {
                breaker: self,
                probe: None,
            }),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                inner.probe_id = inner.probe_id.wrapping_add(1);
                Ok(BreakerPermit {
                    breaker: self,
                    probe: Some(inner.probe_id),
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(TransferError::CircuitOpen {
                destination: self.destination.clone(),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit for {} closed", self.destination);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.reopen_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if open {
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                self.destination, inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.reopen_at = Some(Instant::now() + self.config.cooldown());
            inner.probe_in_flight = false;
        }
    }
}

/// Permission for one attempt from [`CircuitBreaker::try_acquire`].
///
/// Dropping a half-open probe without recording an outcome, for example when
/// the attempt is cancelled, lets the next caller probe instead.
#[must_use = "record the attempt outcome with success() or failure()"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn success(mut self) {
        self.probe = None;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.probe = None;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        let Some(probe) = self.probe else {
            return;
        };
        let mut inner = self.breaker.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight && inner.probe_id == probe
        {
            debug!(
                "Probe for {} ended without an outcome",
                self.breaker.destination
            );
            inner.probe_in_flight = false;
        }
    }
}

/// Circuit breakers keyed by destination (`AE@host:port`), created on first use
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn for_node(&self, node: &RemoteNode) -> Arc<CircuitBreaker> {
        self.get(&node.destination_key())
    }

    pub fn get(&self, destination: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(destination)
        {
            return breaker.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(destination, self.config.clone())))
            .clone()
    }

    /// State of every known destination
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut states: Vec<_> = breakers
            .iter()
            .map(|b| (b.destination().to_string(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "SCP1@localhost:11112",
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown_ms: 1_000,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = breaker();
        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Err(TransferError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_probe_then_closes() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert!(breaker.try_acquire().is_err());

        probe.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(!breaker.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_the_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        let probe = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_err());
        drop(probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        probe.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_leaves_newer_probe_alone() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        let stale = breaker.try_acquire().unwrap();

        // Another path records a failure, and a new probe starts after the cooldown.
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;
        let current = breaker.try_acquire().unwrap();
        drop(stale);
        assert!(breaker.try_acquire().is_err());
        current.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_cooldown() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(breaker.try_acquire().is_err());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_keys_by_destination() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = RemoteNode::new("PACS", "10.0.0.1", 104);
        let b = RemoteNode::new("PACS", "10.0.0.2", 104);

        let first = registry.for_node(&a);
        assert!(Arc::ptr_eq(&first, &registry.for_node(&a)));
        assert!(!Arc::ptr_eq(&first, &registry.for_node(&b)));
        assert_eq!(first.destination(), "PACS@10.0.0.1:104");
        assert_eq!(registry.states().len(), 2);
    }
}
