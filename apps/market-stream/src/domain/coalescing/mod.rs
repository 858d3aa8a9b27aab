//! Update Coalescing
//!
//! Bounds the rate of high-frequency updates delivered downstream.
//!
//! - **Depth**: trailing-edge throttle, last value wins. At most one book per
//!   window reaches the consumer; intermediate snapshots are discarded.
//! - **Trades**: bounded ring buffer flushed as one batch per window. Nothing
//!   is dropped within capacity; on overflow the oldest trade goes first.
//!
//! Both channels are pure state machines. They report when a timer must be
//! armed and the owner fires it, so the caller stays in control of time.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::market::{StreamType, Trade};
use crate::domain::order_book::OrderBook;

/// Default depth throttle window.
pub const DEFAULT_DEPTH_WINDOW: Duration = Duration::from_millis(120);

/// Default trade batch window.
pub const DEFAULT_TRADE_WINDOW: Duration = Duration::from_millis(80);

/// Default trade buffer capacity.
pub const DEFAULT_TRADE_CAPACITY: usize = 200;

// =============================================================================
// Depth Throttle
// =============================================================================

/// Outcome of offering a snapshot to the depth throttle.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    /// Window already elapsed: deliver this book now.
    EmitNow(OrderBook),
    /// Book stored; arm a timer for the remainder of the window.
    Arm(Duration),
    /// Book stored; a timer is already armed.
    Buffered,
}

/// Trailing-edge throttle for depth snapshots.
///
/// The window opens when the throttle is created, so a burst right after
/// subscribing yields a single trailing emission.
#[derive(Debug, Clone)]
pub struct DepthThrottle {
    window: Duration,
    last_emit: Instant,
    latest: Option<OrderBook>,
    armed: bool,
}

impl DepthThrottle {
    /// Create a throttle whose first window starts at `now`.
    #[must_use]
    pub const fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            last_emit: now,
            latest: None,
            armed: false,
        }
    }

    /// Offer a normalized snapshot.
    pub fn offer(&mut self, book: OrderBook, now: Instant) -> ThrottleDecision {
        let elapsed = now.saturating_duration_since(self.last_emit);
        if elapsed >= self.window {
            self.last_emit = now;
            self.latest = None;
            return ThrottleDecision::EmitNow(book);
        }

        self.latest = Some(book);
        if self.armed {
            ThrottleDecision::Buffered
        } else {
            self.armed = true;
            ThrottleDecision::Arm(self.window - elapsed)
        }
    }

    /// Timer fired: take the latest snapshot, if any, and clear the armed flag.
    pub fn fire(&mut self, now: Instant) -> Option<OrderBook> {
        self.armed = false;
        let book = self.latest.take()?;
        self.last_emit = now;
        Some(book)
    }

    /// Whether a timer is armed.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Drop any pending snapshot and disarm.
    pub fn clear(&mut self) {
        self.latest = None;
        self.armed = false;
    }
}

// =============================================================================
// Trade Batcher
// =============================================================================

/// Result of pushing one trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// The caller must arm the batch timer.
    pub arm: bool,
    /// The oldest buffered trade was dropped to make room.
    pub evicted: bool,
}

/// Bounded ring of trades flushed as one batch per window.
#[derive(Debug, Clone)]
pub struct TradeBatcher {
    capacity: usize,
    buffer: VecDeque<Trade>,
    armed: bool,
}

impl TradeBatcher {
    /// Create a batcher holding at most `capacity` trades.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
            armed: false,
        }
    }

    /// Append a trade, evicting the oldest when full.
    pub fn push(&mut self, trade: Trade) -> PushOutcome {
        let evicted = if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
            true
        } else {
            false
        };
        self.buffer.push_back(trade);

        let arm = !self.armed;
        self.armed = true;
        PushOutcome { arm, evicted }
    }

    /// Timer fired: drain the whole batch in arrival order.
    pub fn flush(&mut self) -> Vec<Trade> {
        self.armed = false;
        self.buffer.drain(..).collect()
    }

    /// Buffered trades, oldest first.
    pub fn buffered(&self) -> impl Iterator<Item = &Trade> {
        self.buffer.iter()
    }

    /// Number of buffered trades.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a timer is armed.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Drop every buffered trade and disarm.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.armed = false;
    }
}

// =============================================================================
// Coalescer
// =============================================================================

/// Coalescing state attached to one subscription.
#[derive(Debug, Clone)]
pub enum CoalescingChannel {
    /// Tickers pass straight through.
    Passthrough,
    /// Depth snapshots are throttled.
    Depth(DepthThrottle),
    /// Trades are batched.
    Trades(TradeBatcher),
}

impl CoalescingChannel {
    /// Drop buffered data and disarm timers.
    pub fn clear(&mut self) {
        match self {
            Self::Passthrough => {}
            Self::Depth(throttle) => throttle.clear(),
            Self::Trades(batcher) => batcher.clear(),
        }
    }
}

/// Coalescing windows and capacities; builds per-subscription channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCoalescer {
    /// Depth throttle window.
    pub depth_window: Duration,
    /// Trade batch window.
    pub trade_window: Duration,
    /// Trade ring capacity.
    pub trade_capacity: usize,
}

impl Default for UpdateCoalescer {
    fn default() -> Self {
        Self {
            depth_window: DEFAULT_DEPTH_WINDOW,
            trade_window: DEFAULT_TRADE_WINDOW,
            trade_capacity: DEFAULT_TRADE_CAPACITY,
        }
    }
}

impl UpdateCoalescer {
    /// Fresh channel for a stream type, opened at `now`.
    #[must_use]
    pub fn channel(&self, stream: StreamType, now: Instant) -> CoalescingChannel {
        match stream {
            StreamType::Ticker => CoalescingChannel::Passthrough,
            StreamType::Depth => {
                CoalescingChannel::Depth(DepthThrottle::new(self.depth_window, now))
            }
            StreamType::Trade => CoalescingChannel::Trades(TradeBatcher::new(self.trade_capacity)),
        }
    }
}
