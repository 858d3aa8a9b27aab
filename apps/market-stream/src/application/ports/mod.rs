//! Port Interfaces
//!
//! Contracts between the connection supervisor and the outside world,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`FeedConnector`]: opens one upstream transport per subscription
//! - [`TransportHandle`]: send/close on an open transport
//! - [`MarketDataListener`]: push-only delivery to the consuming layer
//!
//! Transports report back through an [`EventSink`], which tags every event
//! with the subscription and connection generation that produced it.

use std::fmt;
use std::sync::Arc;

use crate::domain::connection::{ConnectionState, ConnectionStats};
use crate::domain::market::{Provider, SubscriptionId, Ticker, Trade};
use crate::domain::order_book::OrderBook;

// =============================================================================
// Transport Events
// =============================================================================

/// What happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Socket open and ready to send.
    Open,
    /// Text frame received.
    Message(String),
    /// Transport-level error. A `Close` always follows.
    Error(String),
    /// Socket closed.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Transport event tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Subscription the transport belongs to.
    pub id: SubscriptionId,
    /// Connection generation that produced the event.
    pub generation: u64,
    /// Event payload.
    pub kind: TransportEventKind,
}

type Deliver = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Handle transports use to report events to their owner.
#[derive(Clone)]
pub struct EventSink {
    id: SubscriptionId,
    generation: u64,
    deliver: Deliver,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl EventSink {
    /// Create a sink that hands every event to `deliver`.
    pub fn new(
        id: SubscriptionId,
        generation: u64,
        deliver: impl Fn(TransportEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            generation,
            deliver: Arc::new(deliver),
        }
    }

    /// Subscription this sink reports for.
    #[must_use]
    pub const fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Connection generation this sink reports for.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn emit(&self, kind: TransportEventKind) {
        (self.deliver)(TransportEvent {
            id: self.id.clone(),
            generation: self.generation,
            kind,
        });
    }

    /// Report that the transport opened.
    pub fn open(&self) {
        self.emit(TransportEventKind::Open);
    }

    /// Report a received text frame.
    pub fn message(&self, text: impl Into<String>) {
        self.emit(TransportEventKind::Message(text.into()));
    }

    /// Report a transport error.
    pub fn error(&self, error: impl Into<String>) {
        self.emit(TransportEventKind::Error(error.into()));
    }

    /// Report that the transport closed.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.emit(TransportEventKind::Close {
            code,
            reason: reason.into(),
        });
    }
}

// =============================================================================
// Upstream Ports
// =============================================================================

/// Errors raised by transport adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be started.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The transport is closed or its writer is gone.
    #[error("transport closed")]
    Closed,
}

/// Parameters for opening one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Subscription being connected.
    pub id: SubscriptionId,
    /// Connection target.
    pub url: String,
    /// Connection generation.
    pub generation: u64,
}

/// An open (or opening) upstream transport.
#[cfg_attr(test, mockall::automock)]
pub trait TransportHandle: Send {
    /// Queue a text frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the transport is gone.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Close the transport. Idempotent.
    fn close(&self, code: u16, reason: &str);
}

/// Opens upstream transports.
///
/// Implementations must not block: they start the connection in the
/// background and report progress through the sink.
#[cfg_attr(test, mockall::automock)]
pub trait FeedConnector: Send + Sync {
    /// Start connecting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the transport cannot even be started.
    fn connect(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

// =============================================================================
// Downstream Port
// =============================================================================

/// Push-only delivery of market data and lifecycle changes.
#[cfg_attr(test, mockall::automock)]
pub trait MarketDataListener: Send + Sync {
    /// A ticker update.
    fn on_ticker(&self, provider: Provider, ticker: Ticker);

    /// A throttled, normalized order book.
    fn on_depth_update(&self, provider: Provider, book: OrderBook);

    /// A batch of trades in arrival order.
    fn on_trade_batch(&self, provider: Provider, trades: Vec<Trade>);

    /// A subscription changed state.
    fn on_connection_change(
        &self,
        id: &SubscriptionId,
        state: ConnectionState,
        stats: &ConnectionStats,
    );
}
