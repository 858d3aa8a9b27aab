#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_precision_loss
    )
)]

//! Market Stream - Real-Time Market Data Connection Supervisor
//!
//! Maintains ticker, depth and trade subscriptions for one trading pair at a
//! time across Binance, Bybit and OKX. Drops are retried with backoff behind
//! a circuit breaker, and depth and trade updates are coalesced before they
//! reach consumers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: pure state and data, no I/O
//!   - `market`: providers, pairs, subscription identity, tickers and trades
//!   - `order_book`: validation and normalization of raw depth
//!   - `resilience`: retry policies and the circuit breaker registry
//!   - `coalescing`: depth throttle and trade batcher
//!   - `feed`: provider capability table and frame decoders
//!   - `connection`: connection state, statistics and errors
//!
//! - **Application**: ports and the supervisor actor
//!   - `ports`: `FeedConnector`, `TransportHandle`, `MarketDataListener`
//!   - `services`: `ConnectionSupervisor`, `BackoffScheduler`
//!
//! - **Infrastructure**: adapters
//!   - `transport`: WebSocket connector with heartbeat
//!   - `broadcast`: listener that fans out over tokio broadcast channels
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Binance WS ──┐                         ┌──────────────┐
//! Bybit WS   ──┼──► ConnectionSupervisor ├──► Listener ──► consumers
//! OKX WS     ──┘   (decode, normalize,   └──────────────┘
//!                   throttle, batch)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types and pure connection logic.
pub mod domain;

/// Application layer - Supervisor and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, ConnectionStats, FeedError};
pub use domain::market::{
    Provider, Side, StreamType, SubscriptionId, SubscriptionSpec, Ticker, Trade, TradingPair,
};
pub use domain::order_book::{OrderBook, OrderBookLevel, OrderBookNormalizer};

// Ports and supervisor
pub use application::ports::{
    ConnectRequest, EventSink, FeedConnector, MarketDataListener, TransportError,
    TransportEvent, TransportEventKind, TransportHandle,
};
pub use application::services::{
    ConnectionSupervisor, SupervisorConfig, SupervisorError, SupervisorHandle, SupervisorSnapshot,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, StreamConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Broadcast hub
pub use infrastructure::broadcast::{BroadcastConfig, BroadcastHub, SharedBroadcastHub};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
