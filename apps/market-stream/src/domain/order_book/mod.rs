//! Order Book Normalization
//!
//! Turns raw provider depth levels into a bounded, sorted book.
//!
//! # Invariants
//!
//! A normalized [`OrderBook`]:
//! - has bids sorted by price descending and asks ascending
//! - holds at most `depth` levels per side
//! - never contains non-finite values or non-positive quantities

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default number of levels kept per side.
pub const DEFAULT_DEPTH: usize = 15;

// =============================================================================
// Raw Levels
// =============================================================================

/// A numeric field as providers send it: either a JSON string or a number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    /// Decimal string such as `"101.25"`.
    Text(String),
    /// Plain JSON number.
    Number(f64),
}

impl RawNumber {
    /// Parse to `f64`, returning `None` for unparseable or non-finite values.
    #[must_use]
    pub fn to_finite(&self) -> Option<f64> {
        let value = match self {
            Self::Text(text) => text.trim().parse::<f64>().ok()?,
            Self::Number(n) => *n,
        };
        value.is_finite().then_some(value)
    }
}

impl From<f64> for RawNumber {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RawNumber {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One unvalidated `[price, quantity, ...]` level.
///
/// Trailing elements (order counts, liquidation flags) are ignored. A level
/// with fewer than two elements never validates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "Vec<RawNumber>")]
pub struct RawLevel {
    /// Price field.
    pub price: Option<RawNumber>,
    /// Quantity field.
    pub quantity: Option<RawNumber>,
}

impl From<Vec<RawNumber>> for RawLevel {
    fn from(values: Vec<RawNumber>) -> Self {
        let mut iter = values.into_iter();
        Self {
            price: iter.next(),
            quantity: iter.next(),
        }
    }
}

impl<P: Into<RawNumber>, Q: Into<RawNumber>> From<(P, Q)> for RawLevel {
    fn from((price, quantity): (P, Q)) -> Self {
        Self {
            price: Some(price.into()),
            quantity: Some(quantity.into()),
        }
    }
}

/// Unvalidated depth snapshot as decoded from a provider frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawDepth {
    /// Bid levels in provider order.
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    /// Ask levels in provider order.
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

impl RawDepth {
    /// Build a raw snapshot from `(price, quantity)` pairs.
    #[must_use]
    pub fn from_pairs<L: Into<RawLevel>>(
        bids: impl IntoIterator<Item = L>,
        asks: impl IntoIterator<Item = L>,
    ) -> Self {
        Self {
            bids: bids.into_iter().map(Into::into).collect(),
            asks: asks.into_iter().map(Into::into).collect(),
        }
    }
}

/// Raw book rebuilt from a snapshot plus incremental deltas.
///
/// Providers that push deltas send absolute quantities per price; a zero
/// quantity removes the level.
#[derive(Debug, Clone, Default)]
pub struct DepthReplica {
    bids: HashMap<String, RawLevel>,
    asks: HashMap<String, RawLevel>,
}

fn price_key(level: &RawLevel) -> Option<String> {
    level
        .price
        .as_ref()
        .and_then(RawNumber::to_finite)
        .map(|price| price.to_string())
}

fn merge(side: &mut HashMap<String, RawLevel>, levels: Vec<RawLevel>) {
    for level in levels {
        let Some(key) = price_key(&level) else {
            continue;
        };
        let removes = level
            .quantity
            .as_ref()
            .and_then(RawNumber::to_finite)
            .is_none_or(|quantity| quantity == 0.0);
        if removes {
            side.remove(&key);
        } else {
            side.insert(key, level);
        }
    }
}

impl DepthReplica {
    /// Replace the whole book with a snapshot.
    pub fn replace(&mut self, snapshot: RawDepth) {
        self.clear();
        self.apply(snapshot);
    }

    /// Merge a delta into the book.
    pub fn apply(&mut self, delta: RawDepth) {
        merge(&mut self.bids, delta.bids);
        merge(&mut self.asks, delta.asks);
    }

    /// Current levels, unsorted.
    #[must_use]
    pub fn to_raw(&self) -> RawDepth {
        RawDepth {
            bids: self.bids.values().cloned().collect(),
            asks: self.asks.values().cloned().collect(),
        }
    }

    /// Drop every level.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }
}

// =============================================================================
// Normalized Book
// =============================================================================

/// A validated price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    /// Level price.
    pub price: f64,
    /// Resting quantity at this price.
    pub quantity: f64,
}

impl OrderBookLevel {
    /// Create a level.
    #[must_use]
    pub const fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

/// Sorted, bounded order book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Bids, best (highest) first.
    pub bids: Vec<OrderBookLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBook {
    /// Best bid, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.bids.first().copied()
    }

    /// Best ask, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.asks.first().copied()
    }

    /// Spread between best ask and best bid.
    #[must_use]
    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Whether both sides are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

// =============================================================================
// Normalizer
// =============================================================================

/// Validate a single raw level.
///
/// A level is valid iff price and quantity both parse to finite numbers and
/// quantity is strictly positive. Non-positive prices are rejected as well:
/// no venue quotes them, and a zero price would sort a garbage level to the
/// edge of the book.
#[must_use]
pub fn validate(level: &RawLevel) -> Option<OrderBookLevel> {
    let price = level.price.as_ref()?.to_finite()?;
    let quantity = level.quantity.as_ref()?.to_finite()?;
    (price > 0.0 && quantity > 0.0).then_some(OrderBookLevel { price, quantity })
}

/// Normalizes raw depth snapshots into bounded sorted books.
#[derive(Debug, Clone, Copy)]
pub struct OrderBookNormalizer {
    depth: usize,
}

impl Default for OrderBookNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

impl OrderBookNormalizer {
    /// Create a normalizer keeping `depth` levels per side.
    #[must_use]
    pub const fn new(depth: usize) -> Self {
        Self { depth }
    }

    /// Levels kept per side.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Filter, sort and truncate both sides. Invalid levels are dropped silently.
    #[must_use]
    pub fn normalize(&self, raw: &RawDepth) -> OrderBook {
        let mut bids: Vec<_> = raw.bids.iter().filter_map(validate).collect();
        let mut asks: Vec<_> = raw.asks.iter().filter_map(validate).collect();

        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));

        bids.truncate(self.depth);
        asks.truncate(self.depth);

        OrderBook { bids, asks }
    }
}
