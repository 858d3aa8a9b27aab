//! Domain Layer - Market data types and pure connection logic.
//!
//! Everything here is synchronous and owns no I/O. Time is passed in
//! explicitly so the state machines can be driven by a paused clock.

/// Connection state, statistics and failure taxonomy.
pub mod connection;

/// Depth throttling and trade batching.
pub mod coalescing;

/// Provider capability table and frame decoders.
pub mod feed;

/// Providers, trading pairs, subscription identity and payloads.
pub mod market;

/// Order book validation and normalization.
pub mod order_book;

/// Retry policies and the circuit breaker registry.
pub mod resilience;
