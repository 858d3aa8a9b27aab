//! Retry Policies
//!
//! Exponential backoff per stream class:
//!
//! ```text
//! delay(attempt) = min(max_delay, base_delay * multiplier ^ attempt)
//! ```
//!
//! `attempt` is zero-indexed. Jitter is optional and disabled by default so
//! the schedule stays deterministic.

use std::time::Duration;

use rand::Rng;

/// Retry class of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamClass {
    /// Long-lived streams; effectively unbounded retries.
    #[default]
    Streaming,
    /// Request/response style operations; small bounded retry count.
    Request,
}

impl StreamClass {
    /// Class name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Request => "request",
        }
    }
}

/// Compute the backoff delay for a zero-indexed attempt.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, multiplier: f64, max: Duration) -> Duration {
    #[allow(clippy::cast_precision_loss)]
    let base_millis = base.as_millis() as f64;
    #[allow(clippy::cast_precision_loss)]
    let max_millis = max.as_millis() as f64;

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled = base_millis * multiplier.powi(exponent);
    let capped = if scaled.is_finite() {
        scaled.min(max_millis)
    } else {
        max_millis
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Duration::from_millis(capped.max(0.0).round() as u64)
}

/// Retry policy for one stream class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum reconnection attempts before the subscription fails.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay (e.g. 0.1 = ±10%). Zero disables it.
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Policy for long-lived streams: 5s base, ×1.5, capped at 30s, unbounded.
    #[must_use]
    pub const fn streaming() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(5_000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.0,
        }
    }

    /// Policy for request/response operations: 1s base, ×2, capped at 10s, 3 attempts.
    #[must_use]
    pub const fn request() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            jitter_factor: 0.0,
        }
    }

    /// Whether another attempt is permitted after `attempts` retries.
    #[must_use]
    pub const fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Deterministic delay for a zero-indexed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.multiplier, self.max_delay)
    }

    /// Delay for an attempt with jitter applied, never exceeding `max_delay`.
    #[must_use]
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = delay.as_millis() as f64;
        let jitter_range = base_millis * self.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        #[allow(clippy::cast_precision_loss)]
        let max_millis = self.max_delay.as_millis() as f64;
        let adjusted = (base_millis + jitter).clamp(1.0, max_millis.max(1.0));

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted as u64)
    }
}

/// Retry policies indexed by stream class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    /// Policy for [`StreamClass::Streaming`].
    pub streaming: RetryPolicy,
    /// Policy for [`StreamClass::Request`].
    pub request: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            streaming: RetryPolicy::streaming(),
            request: RetryPolicy::request(),
        }
    }
}

impl RetryPolicies {
    /// Policy for a class.
    #[must_use]
    pub const fn for_class(&self, class: StreamClass) -> &RetryPolicy {
        match class {
            StreamClass::Streaming => &self.streaming,
            StreamClass::Request => &self.request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 5_000 ; "first attempt uses base")]
    #[test_case(1, 7_500 ; "second attempt")]
    #[test_case(2, 11_250 ; "third attempt")]
    #[test_case(3, 16_875 ; "fourth attempt")]
    #[test_case(4, 25_313 ; "fifth attempt rounds")]
    #[test_case(5, 30_000 ; "capped at max")]
    #[test_case(400, 30_000 ; "huge attempt stays capped")]
    fn streaming_schedule(attempt: u32, expected_ms: u64) {
        assert_eq!(
            RetryPolicy::streaming().delay_for(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test_case(0, 1_000)]
    #[test_case(1, 2_000)]
    #[test_case(2, 4_000)]
    #[test_case(3, 8_000)]
    #[test_case(4, 10_000)]
    fn request_schedule(attempt: u32, expected_ms: u64) {
        assert_eq!(
            RetryPolicy::request().delay_for(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn free_function_matches_formula() {
        let delay = backoff_delay(
            3,
            Duration::from_millis(5_000),
            1.5,
            Duration::from_millis(30_000),
        );
        assert_eq!(delay, Duration::from_millis(16_875));
    }

    #[test]
    fn attempt_limits() {
        let request = RetryPolicy::request();
        assert!(request.allows(0));
        assert!(request.allows(2));
        assert!(!request.allows(3));

        let streaming = RetryPolicy::streaming();
        assert!(streaming.allows(1_000_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.1,
            ..RetryPolicy::request()
        };
        for _ in 0..100 {
            let millis = policy.jittered_delay_for(0).as_millis();
            assert!((900..=1_100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn policies_by_class() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.for_class(StreamClass::Request).max_attempts, 3);
        assert_eq!(policies.for_class(StreamClass::Streaming).max_attempts, u32::MAX);
    }
}
