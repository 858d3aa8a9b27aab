//! Resilience patterns for upstream connections.
//!
//! Backoff policies per stream class and a coarse per-service circuit
//! breaker registry.

mod backoff;
mod circuit_breaker;

pub use backoff::{RetryPolicies, RetryPolicy, StreamClass, backoff_delay};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitBreakerState,
};
