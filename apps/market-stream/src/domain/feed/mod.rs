//! Provider Capability Table
//!
//! One static entry per [`Provider`] describing how to reach a stream, which
//! handshake it needs and how to decode its frames. The supervisor looks the
//! entry up by provider identity and never branches on the provider itself.
//!
//! # Handshake styles
//!
//! - [`Handshake::Implicit`]: the subscription is encoded in the URL.
//! - [`Handshake::SubscribeMessage`]: an explicit subscribe frame naming a
//!   channel and instrument is sent right after the socket opens.

mod binance;
mod bybit;
mod okx;

use crate::domain::market::{Provider, Side, StreamType, Ticker, Trade, TradingPair};
use crate::domain::order_book::{RawDepth, RawNumber};

// =============================================================================
// Errors
// =============================================================================

/// A frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Payload is not valid JSON or does not match the expected shape.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A required numeric field did not parse.
    #[error("invalid number in field {0}")]
    InvalidNumber(&'static str),

    /// Frame carries no recognizable payload for this stream.
    #[error("unrecognized frame")]
    UnknownFrame,

    /// Provider reported an error.
    #[error("provider error: {0}")]
    Provider(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidFrame(err.to_string())
    }
}

impl ProtocolError {
    /// Short label used as the metrics `reason`.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidFrame(_) => "invalid_frame",
            Self::InvalidNumber(_) => "invalid_number",
            Self::UnknownFrame => "unknown_frame",
            Self::Provider(_) => "provider_error",
        }
    }
}

// =============================================================================
// Decoded Frames
// =============================================================================

/// Payload decoded from one provider frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Ticker update.
    Ticker(Ticker),
    /// Full depth snapshot.
    Depth(RawDepth),
    /// Incremental depth update to merge into the last snapshot.
    DepthDelta(RawDepth),
    /// One or more trades, in exchange order.
    Trades(Vec<Trade>),
}

// =============================================================================
// Capability Entries
// =============================================================================

type TargetFn = fn(StreamType, &TradingPair) -> String;
type SubscribeFn = fn(StreamType, &TradingPair) -> String;
type DecodeFn = fn(StreamType, &str) -> Result<Option<InboundFrame>, ProtocolError>;

/// Post-connect handshake style.
#[derive(Debug, Clone, Copy)]
pub enum Handshake {
    /// Nothing to send; the target URL selects the stream.
    Implicit,
    /// Send the built subscribe frame immediately after open.
    SubscribeMessage(SubscribeFn),
}

/// Capability entry for one provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderProfile {
    /// Provider this entry describes.
    pub provider: Provider,
    /// Handshake style.
    pub handshake: Handshake,
    target: TargetFn,
    decode: DecodeFn,
}

impl ProviderProfile {
    /// Connection target for a stream.
    #[must_use]
    pub fn target(&self, stream: StreamType, pair: &TradingPair) -> String {
        (self.target)(stream, pair)
    }

    /// Subscribe frame to send after open, if this provider needs one.
    #[must_use]
    pub fn handshake_message(&self, stream: StreamType, pair: &TradingPair) -> Option<String> {
        match self.handshake {
            Handshake::Implicit => None,
            Handshake::SubscribeMessage(build) => Some(build(stream, pair)),
        }
    }

    /// Decode a text frame. `Ok(None)` is a control frame (ack, pong).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for malformed frames or provider-reported errors.
    pub fn decode(
        &self,
        stream: StreamType,
        text: &str,
    ) -> Result<Option<InboundFrame>, ProtocolError> {
        (self.decode)(stream, text)
    }
}

static PROFILES: [ProviderProfile; 3] = [
    ProviderProfile {
        provider: Provider::Binance,
        handshake: Handshake::Implicit,
        target: binance::target,
        decode: binance::decode,
    },
    ProviderProfile {
        provider: Provider::Bybit,
        handshake: Handshake::SubscribeMessage(bybit::subscribe_message),
        target: bybit::target,
        decode: bybit::decode,
    },
    ProviderProfile {
        provider: Provider::Okx,
        handshake: Handshake::SubscribeMessage(okx::subscribe_message),
        target: okx::target,
        decode: okx::decode,
    },
];

/// Capability entry for a provider.
#[must_use]
pub fn profile(provider: Provider) -> &'static ProviderProfile {
    match provider {
        Provider::Binance => &PROFILES[0],
        Provider::Bybit => &PROFILES[1],
        Provider::Okx => &PROFILES[2],
    }
}

// =============================================================================
// Shared Parsing Helpers
// =============================================================================

fn required(field: &'static str, value: &RawNumber) -> Result<f64, ProtocolError> {
    value.to_finite().ok_or(ProtocolError::InvalidNumber(field))
}

fn optional(value: Option<&RawNumber>) -> Option<f64> {
    value.and_then(RawNumber::to_finite)
}

#[allow(clippy::cast_possible_truncation)]
fn timestamp(value: Option<&RawNumber>) -> Option<i64> {
    optional(value).map(|ms| ms as i64)
}

fn side_from(text: &str) -> Result<Side, ProtocolError> {
    match text.to_ascii_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        _ => Err(ProtocolError::InvalidFrame(format!("unknown side {text}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    #[test]
    fn table_is_keyed_by_provider() {
        for provider in Provider::all() {
            assert_eq!(profile(*provider).provider, *provider);
        }
    }

    #[test]
    fn binance_needs_no_handshake() {
        let binance = profile(Provider::Binance);
        assert!(binance.handshake_message(StreamType::Depth, &pair()).is_none());
        assert_eq!(
            binance.target(StreamType::Depth, &pair()),
            "wss://stream.binance.com:9443/ws/btcusdt@depth20@100ms"
        );
    }

    #[test]
    fn explicit_providers_build_subscribe_frames() {
        let bybit = profile(Provider::Bybit)
            .handshake_message(StreamType::Trade, &pair())
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&bybit).unwrap();
        assert_eq!(json["op"], "subscribe");
        assert_eq!(json["args"][0], "publicTrade.BTCUSDT");

        let okx = profile(Provider::Okx)
            .handshake_message(StreamType::Ticker, &pair())
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&okx).unwrap();
        assert_eq!(json["args"][0]["channel"], "tickers");
        assert_eq!(json["args"][0]["instId"], "BTC-USDT");
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        for provider in Provider::all() {
            let err = profile(*provider)
                .decode(StreamType::Ticker, "not json")
                .unwrap_err();
            assert_eq!(err.reason(), "invalid_frame");
        }
    }
}
