//! Broadcast Channel Adapters
//!
//! Implements [`MarketDataListener`] with tokio broadcast channels for fan-out
//! to any number of in-process consumers.
//!
//! # Architecture
//!
//! The `BroadcastHub` provides a separate channel for each delivery kind:
//! - Tickers, passed through as received
//! - Order books, throttled and normalized
//! - Trade batches
//! - Subscription state changes
//!
//! Sends never block the supervisor. Slow receivers observe `Lagged`.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::application::ports::MarketDataListener;
use crate::domain::connection::{ConnectionState, ConnectionStats};
use crate::domain::market::{Provider, SubscriptionId, Ticker, Trade};
use crate::domain::order_book::OrderBook;
use crate::infrastructure::config::BroadcastSettings;

// =============================================================================
// Broadcast Messages
// =============================================================================

/// Ticker broadcast message.
#[derive(Debug, Clone)]
pub struct TickerBroadcast {
    /// Source provider.
    pub provider: Provider,
    /// The ticker.
    pub ticker: Ticker,
}

/// Order book broadcast message.
#[derive(Debug, Clone)]
pub struct DepthBroadcast {
    /// Source provider.
    pub provider: Provider,
    /// The normalized book.
    pub book: OrderBook,
}

/// Trade batch broadcast message.
#[derive(Debug, Clone)]
pub struct TradeBatchBroadcast {
    /// Source provider.
    pub provider: Provider,
    /// Trades in arrival order.
    pub trades: Arc<[Trade]>,
}

/// Subscription state change broadcast message.
#[derive(Debug, Clone)]
pub struct ConnectionBroadcast {
    /// Subscription that changed.
    pub id: SubscriptionId,
    /// New state.
    pub state: ConnectionState,
    /// Statistics at the time of the change.
    pub stats: ConnectionStats,
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Configuration for broadcast channel capacities.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Capacity for the ticker channel.
    pub tickers_capacity: usize,
    /// Capacity for the depth channel.
    pub depth_capacity: usize,
    /// Capacity for the trade batch channel.
    pub trades_capacity: usize,
    /// Capacity for the connection change channel.
    pub connections_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastSettings::default().into()
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            tickers_capacity: settings.tickers_capacity,
            depth_capacity: settings.depth_capacity,
            trades_capacity: settings.trades_capacity,
            connections_capacity: settings.connections_capacity,
        }
    }
}

/// Central hub for all broadcast channels.
///
/// # Example
///
/// ```rust
/// use market_stream::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
///
/// let hub = BroadcastHub::new(BroadcastConfig::default());
/// let mut depth = hub.depth_rx();
/// assert_eq!(hub.stats().depth_receivers, 1);
/// # drop(depth);
/// ```
#[derive(Debug)]
#[allow(clippy::struct_field_names)]
pub struct BroadcastHub {
    tickers_tx: broadcast::Sender<TickerBroadcast>,
    depth_tx: broadcast::Sender<DepthBroadcast>,
    trades_tx: broadcast::Sender<TradeBatchBroadcast>,
    connections_tx: broadcast::Sender<ConnectionBroadcast>,
}

impl BroadcastHub {
    /// Create a new broadcast hub with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            tickers_tx: broadcast::channel(config.tickers_capacity.max(1)).0,
            depth_tx: broadcast::channel(config.depth_capacity.max(1)).0,
            trades_tx: broadcast::channel(config.trades_capacity.max(1)).0,
            connections_tx: broadcast::channel(config.connections_capacity.max(1)).0,
        }
    }

    /// Create a new broadcast hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Get a new receiver for tickers.
    #[must_use]
    pub fn tickers_rx(&self) -> broadcast::Receiver<TickerBroadcast> {
        self.tickers_tx.subscribe()
    }

    /// Get a new receiver for order books.
    #[must_use]
    pub fn depth_rx(&self) -> broadcast::Receiver<DepthBroadcast> {
        self.depth_tx.subscribe()
    }

    /// Get a new receiver for trade batches.
    #[must_use]
    pub fn trades_rx(&self) -> broadcast::Receiver<TradeBatchBroadcast> {
        self.trades_tx.subscribe()
    }

    /// Get a new receiver for subscription state changes.
    #[must_use]
    pub fn connections_rx(&self) -> broadcast::Receiver<ConnectionBroadcast> {
        self.connections_tx.subscribe()
    }

    /// Get statistics about all channels.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            tickers_receivers: self.tickers_tx.receiver_count(),
            depth_receivers: self.depth_tx.receiver_count(),
            trades_receivers: self.trades_tx.receiver_count(),
            connections_receivers: self.connections_tx.receiver_count(),
        }
    }
}

impl MarketDataListener for BroadcastHub {
    fn on_ticker(&self, provider: Provider, ticker: Ticker) {
        // No receivers is not an error.
        let _ = self.tickers_tx.send(TickerBroadcast { provider, ticker });
    }

    fn on_depth_update(&self, provider: Provider, book: OrderBook) {
        let _ = self.depth_tx.send(DepthBroadcast { provider, book });
    }

    fn on_trade_batch(&self, provider: Provider, trades: Vec<Trade>) {
        let _ = self.trades_tx.send(TradeBatchBroadcast {
            provider,
            trades: trades.into(),
        });
    }

    fn on_connection_change(
        &self,
        id: &SubscriptionId,
        state: ConnectionState,
        stats: &ConnectionStats,
    ) {
        let _ = self.connections_tx.send(ConnectionBroadcast {
            id: id.clone(),
            state,
            stats: stats.clone(),
        });
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Statistics about broadcast channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastStats {
    /// Number of ticker receivers.
    pub tickers_receivers: usize,
    /// Number of depth receivers.
    pub depth_receivers: usize,
    /// Number of trade batch receivers.
    pub trades_receivers: usize,
    /// Number of connection change receivers.
    pub connections_receivers: usize,
}

impl BroadcastStats {
    /// Get total number of receivers across all channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.tickers_receivers
            + self.depth_receivers
            + self.trades_receivers
            + self.connections_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================
