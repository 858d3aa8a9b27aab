//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Broadcast channel adapter for downstream delivery.
pub mod broadcast;

/// Environment-driven configuration.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry setup.
pub mod telemetry;

/// WebSocket transports.
pub mod transport;
