//! Circuit Breaker Registry
//!
//! Coarse, per-service failure gate. One breaker covers a whole logical
//! service (e.g. the aggregate streaming feature), not an individual
//! subscription.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN        (failure_count reaches threshold)
//! OPEN   → attemptable (now - last_failure_at > cooldown)
//! any    → CLOSED      (record_success)
//! ```
//!
//! There is no half-open trial state: once the cooldown has elapsed, attempts
//! are allowed again and the next `record_success`/`record_failure` decides.
//! The breaker gates new attempts only; open connections are unaffected.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures needed to open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before attempts are allowed again.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_millis(30_000),
        }
    }
}

/// Breaker state for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// When the most recent failure was recorded.
    pub last_failure_at: Option<Instant>,
    /// Whether `failure_count` has reached the threshold.
    pub is_open: bool,
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Service name.
    pub service: String,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Whether the circuit is open.
    pub is_open: bool,
    /// Milliseconds until attempts are allowed again (0 when closed or cooled down).
    pub retry_after_ms: u64,
}

/// Registry of breakers keyed by service name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: HashMap<String, CircuitBreakerState>,
}

impl CircuitBreakerRegistry {
    /// Create a registry where every service shares `config`.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state for a service, if anything has been recorded for it.
    #[must_use]
    pub fn state(&self, service: &str) -> Option<&CircuitBreakerState> {
        self.breakers.get(service)
    }

    /// Whether a new attempt against `service` may start at `now`.
    #[must_use]
    pub fn can_attempt(&self, service: &str, now: Instant) -> bool {
        self.retry_after(service, now).is_none()
    }

    /// Remaining cooldown before attempts are allowed, or `None` if they
    /// already are.
    #[must_use]
    pub fn retry_after(&self, service: &str, now: Instant) -> Option<Duration> {
        let state = self.breakers.get(service)?;
        if !state.is_open {
            return None;
        }
        let last_failure = state.last_failure_at?;
        let elapsed = now.saturating_duration_since(last_failure);
        if elapsed > self.config.cooldown {
            None
        } else {
            Some(self.config.cooldown - elapsed + Duration::from_millis(1))
        }
    }

    /// Record a failure. Returns `true` when this call opened the circuit.
    pub fn record_failure(&mut self, service: &str, now: Instant) -> bool {
        let threshold = self.config.failure_threshold;
        let state = self.breakers.entry(service.to_string()).or_default();
        let was_open = state.is_open;

        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);
        state.is_open = state.failure_count >= threshold;

        if state.is_open && !was_open {
            tracing::warn!(
                service,
                failures = state.failure_count,
                cooldown_ms = self.config.cooldown.as_millis(),
                "Circuit breaker opened"
            );
            return true;
        }
        false
    }

    /// Record a success, fully resetting the service's breaker.
    pub fn record_success(&mut self, service: &str) {
        let state = self.breakers.entry(service.to_string()).or_default();
        if state.is_open {
            tracing::info!(service, "Circuit breaker closed");
        }
        *state = CircuitBreakerState::default();
    }

    /// Snapshot of every known breaker, sorted by service name.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|(service, state)| CircuitBreakerSnapshot {
                service: service.clone(),
                failure_count: state.failure_count,
                is_open: state.is_open,
                retry_after_ms: self
                    .retry_after(service, now)
                    .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            })
            .collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "market-stream";

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
    }

    #[test]
    fn unknown_service_is_attemptable() {
        let registry = registry();
        assert!(registry.can_attempt(SERVICE, Instant::now()));
        assert!(registry.state(SERVICE).is_none());
    }

    #[test]
    fn opens_exactly_at_third_failure() {
        let mut registry = registry();
        let now = Instant::now();

        assert!(!registry.record_failure(SERVICE, now));
        assert!(!registry.record_failure(SERVICE, now));
        assert!(registry.can_attempt(SERVICE, now));
        assert!(!registry.state(SERVICE).unwrap().is_open);

        assert!(registry.record_failure(SERVICE, now));
        let state = registry.state(SERVICE).unwrap();
        assert!(state.is_open);
        assert_eq!(state.failure_count, 3);
        assert!(!registry.can_attempt(SERVICE, now));
    }

    #[test]
    fn cooldown_runs_from_last_failure() {
        let mut registry = registry();
        let start = Instant::now();
        for _ in 0..3 {
            registry.record_failure(SERVICE, start);
        }

        // Extra failure while open pushes the cooldown out, but does not re-open.
        let later = start + Duration::from_millis(10_000);
        assert!(!registry.record_failure(SERVICE, later));

        assert!(!registry.can_attempt(SERVICE, start + Duration::from_millis(30_001)));
        assert!(!registry.can_attempt(SERVICE, later + Duration::from_millis(30_000)));
        assert!(registry.can_attempt(SERVICE, later + Duration::from_millis(30_001)));

        // Cooldown expiry re-enables attempts but does not reset the counter.
        let state = registry.state(SERVICE).unwrap();
        assert!(state.is_open);
        assert_eq!(state.failure_count, 4);
    }

    #[test]
    fn retry_after_reports_remaining_cooldown() {
        let mut registry = registry();
        let start = Instant::now();
        for _ in 0..3 {
            registry.record_failure(SERVICE, start);
        }
        let remaining = registry
            .retry_after(SERVICE, start + Duration::from_millis(20_000))
            .unwrap();
        assert_eq!(remaining, Duration::from_millis(10_001));
    }

    #[test]
    fn success_resets_everything() {
        let mut registry = registry();
        let now = Instant::now();
        for _ in 0..5 {
            registry.record_failure(SERVICE, now);
        }
        registry.record_success(SERVICE);

        let state = registry.state(SERVICE).unwrap();
        assert_eq!(state, &CircuitBreakerState::default());
        assert!(registry.can_attempt(SERVICE, now));
    }

    #[test]
    fn services_are_independent() {
        let mut registry = registry();
        let now = Instant::now();
        for _ in 0..3 {
            registry.record_failure("a", now);
        }
        assert!(!registry.can_attempt("a", now));
        assert!(registry.can_attempt("b", now));

        let snapshot = registry.snapshot(now);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].service, "a");
        assert!(snapshot[0].is_open);
        assert_eq!(snapshot[0].retry_after_ms, 30_001);
    }
}
