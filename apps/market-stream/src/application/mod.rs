//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the connection supervisor and the port interfaces
//! it uses to talk to upstream transports and downstream consumers.

/// Port interfaces for upstream transports and downstream listeners.
pub mod ports;

/// Connection supervisor and backoff scheduler.
pub mod services;
