//! Market Identity and Payload Types
//!
//! Identity of a streaming subscription (provider, trading pair, stream type)
//! and the normalized payloads delivered to consumers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::resilience::StreamClass;

// =============================================================================
// Provider
// =============================================================================

/// Upstream market data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Binance spot streams.
    Binance,
    /// Bybit v5 public spot streams.
    Bybit,
    /// OKX v5 public streams.
    Okx,
}

impl Provider {
    /// All supported providers.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Binance, Self::Bybit, Self::Okx]
    }

    /// Parse a provider name, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(Self::Binance),
            "bybit" => Some(Self::Bybit),
            "okx" => Some(Self::Okx),
            _ => None,
        }
    }

    /// Provider name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Okx => "okx",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Stream Type
// =============================================================================

/// Kind of market data carried by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// 24h rolling ticker.
    Ticker,
    /// Order book depth snapshots.
    Depth,
    /// Public trade prints.
    Trade,
}

impl StreamType {
    /// All stream types, in the order they are subscribed.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ticker, Self::Depth, Self::Trade]
    }

    /// Parse a stream type name, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ticker" => Some(Self::Ticker),
            "depth" | "orderbook" | "book" => Some(Self::Depth),
            "trade" | "trades" => Some(Self::Trade),
            _ => None,
        }
    }

    /// Stream type name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Depth => "depth",
            Self::Trade => "trade",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Trading Pair
// =============================================================================

/// Opaque trading pair identifier supplied by the symbol source.
///
/// The supervisor never interprets the pair beyond handing it to the
/// provider table, which formats the provider-specific instrument name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradingPair {
    base: String,
    quote: String,
}

impl TradingPair {
    /// Create a new pair. Both legs are upper-cased.
    #[must_use]
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim().to_uppercase(),
            quote: quote.as_ref().trim().to_uppercase(),
        }
    }

    /// Parse `BASE/QUOTE` or `BASE-QUOTE`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (base, quote) = s.split_once('/').or_else(|| s.split_once('-'))?;
        if base.trim().is_empty() || quote.trim().is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }

    /// Base asset (e.g. `BTC`).
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Quote asset (e.g. `USDT`).
    #[must_use]
    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

// =============================================================================
// Subscription Identity
// =============================================================================

/// Identity of one logical streaming subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId {
    /// Upstream provider.
    pub provider: Provider,
    /// Trading pair.
    pub pair: TradingPair,
    /// Stream type.
    pub stream: StreamType,
}

impl SubscriptionId {
    /// Create a new subscription identity.
    #[must_use]
    pub const fn new(provider: Provider, pair: TradingPair, stream: StreamType) -> Self {
        Self {
            provider,
            pair,
            stream,
        }
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.pair, self.stream)
    }
}

/// Request to maintain a subscription, with the retry class it runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionSpec {
    /// Subscription identity.
    pub id: SubscriptionId,
    /// Retry class governing reconnection.
    pub class: StreamClass,
}

impl SubscriptionSpec {
    /// Long-lived streaming subscription.
    #[must_use]
    pub const fn streaming(provider: Provider, pair: TradingPair, stream: StreamType) -> Self {
        Self {
            id: SubscriptionId::new(provider, pair, stream),
            class: StreamClass::Streaming,
        }
    }

    /// Override the retry class.
    #[must_use]
    pub const fn with_class(mut self, class: StreamClass) -> Self {
        self.class = class;
        self
    }

    /// Every stream type of every provider for one pair.
    #[must_use]
    pub fn for_pair(
        pair: &TradingPair,
        providers: &[Provider],
        streams: &[StreamType],
    ) -> Vec<Self> {
        providers
            .iter()
            .flat_map(|provider| {
                streams
                    .iter()
                    .map(move |stream| Self::streaming(*provider, pair.clone(), *stream))
            })
            .collect()
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buyer was the taker.
    Buy,
    /// Seller was the taker.
    Sell,
}

/// A single public trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Execution price.
    pub price: f64,
    /// Executed quantity.
    pub quantity: f64,
    /// Taker side.
    pub side: Side,
    /// Exchange timestamp in milliseconds since the epoch.
    pub timestamp_ms: i64,
}

impl Trade {
    /// Check that the trade carries a usable price and quantity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.price.is_finite()
            && self.price > 0.0
            && self.quantity.is_finite()
            && self.quantity > 0.0
            && self.timestamp_ms >= 0
    }
}

/// Normalized 24h ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    /// Provider instrument name.
    pub symbol: String,
    /// Last traded price.
    pub last_price: f64,
    /// Price 24h ago.
    pub open_24h: Option<f64>,
    /// 24h high.
    pub high_24h: Option<f64>,
    /// 24h low.
    pub low_24h: Option<f64>,
    /// 24h base volume.
    pub volume_24h: Option<f64>,
    /// Best bid.
    pub best_bid: Option<f64>,
    /// Best ask.
    pub best_ask: Option<f64>,
    /// Exchange timestamp in milliseconds since the epoch.
    pub timestamp_ms: Option<i64>,
}

impl Ticker {
    /// 24h change in percent, when the open is known.
    #[must_use]
    pub fn change_percent_24h(&self) -> Option<f64> {
        self.open_24h
            .filter(|open| *open > 0.0)
            .map(|open| (self.last_price - open) / open * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_parsing() {
        let pair = TradingPair::parse("btc/usdt").unwrap();
        assert_eq!(pair.base(), "BTC");
        assert_eq!(pair.quote(), "USDT");
        assert_eq!(TradingPair::parse("ETH-USDC"), Some(TradingPair::new("eth", "usdc")));
        assert!(TradingPair::parse("BTCUSDT").is_none());
        assert!(TradingPair::parse("/USDT").is_none());
    }

    #[test]
    fn subscription_id_display() {
        let id = SubscriptionId::new(
            Provider::Okx,
            TradingPair::new("BTC", "USDT"),
            StreamType::Depth,
        );
        assert_eq!(id.to_string(), "okx:BTC/USDT:depth");
    }

    #[test]
    fn specs_for_pair_cover_every_combination() {
        let pair = TradingPair::new("BTC", "USDT");
        let specs = SubscriptionSpec::for_pair(&pair, Provider::all(), StreamType::all());
        assert_eq!(specs.len(), 9);
        assert!(specs.iter().all(|s| s.class == StreamClass::Streaming));
    }

    #[test]
    fn provider_and_stream_parsing() {
        assert_eq!(Provider::from_str_case_insensitive("BYBIT"), Some(Provider::Bybit));
        assert_eq!(Provider::from_str_case_insensitive("kraken"), None);
        assert_eq!(StreamType::from_str_case_insensitive("trades"), Some(StreamType::Trade));
        assert_eq!(StreamType::from_str_case_insensitive("book"), Some(StreamType::Depth));
    }

    #[test]
    fn trade_validation() {
        let trade = Trade {
            price: 100.0,
            quantity: 0.5,
            side: Side::Buy,
            timestamp_ms: 1,
        };
        assert!(trade.is_valid());
        assert!(!Trade { quantity: 0.0, ..trade.clone() }.is_valid());
        assert!(!Trade { price: f64::NAN, ..trade }.is_valid());
    }

    #[test]
    fn ticker_change_percent() {
        let ticker = Ticker {
            symbol: "BTCUSDT".to_string(),
            last_price: 110.0,
            open_24h: Some(100.0),
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            best_bid: None,
            best_ask: None,
            timestamp_ms: None,
        };
        assert!((ticker.change_percent_24h().unwrap() - 10.0).abs() < 1e-9);
    }
}
