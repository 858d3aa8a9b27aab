//! Binance spot streams.
//!
//! Raw streams on `wss://stream.binance.com:9443/ws/<symbol>@<channel>`; the
//! subscription is implied by the URL.

use serde::Deserialize;

use super::{InboundFrame, ProtocolError, optional, required, timestamp};
use crate::domain::market::{Side, StreamType, Ticker, Trade, TradingPair};
use crate::domain::order_book::{RawDepth, RawNumber};

const BASE_URL: &str = "wss://stream.binance.com:9443/ws";

fn symbol(pair: &TradingPair) -> String {
    format!("{}{}", pair.base(), pair.quote()).to_lowercase()
}

pub(super) fn target(stream: StreamType, pair: &TradingPair) -> String {
    let channel = match stream {
        StreamType::Ticker => "ticker",
        StreamType::Depth => "depth20@100ms",
        StreamType::Trade => "trade",
    };
    format!("{BASE_URL}/{}@{channel}", symbol(pair))
}

#[derive(Debug, Deserialize)]
struct TickerEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time: Option<RawNumber>,
    #[serde(rename = "c")]
    last: RawNumber,
    #[serde(rename = "o")]
    open: Option<RawNumber>,
    #[serde(rename = "h")]
    high: Option<RawNumber>,
    #[serde(rename = "l")]
    low: Option<RawNumber>,
    #[serde(rename = "v")]
    volume: Option<RawNumber>,
    #[serde(rename = "b")]
    bid: Option<RawNumber>,
    #[serde(rename = "a")]
    ask: Option<RawNumber>,
}

#[derive(Debug, Deserialize)]
struct TradeEvent {
    #[serde(rename = "p")]
    price: RawNumber,
    #[serde(rename = "q")]
    quantity: RawNumber,
    #[serde(rename = "T")]
    trade_time: RawNumber,
    /// Buyer is the maker, so the taker sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

pub(super) fn decode(stream: StreamType, text: &str) -> Result<Option<InboundFrame>, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    // Responses to live subscribe/list requests carry an `id` and no payload.
    if value.get("id").is_some() && value.get("result").is_some() {
        return Ok(None);
    }
    if let Some(msg) = value.get("msg").and_then(serde_json::Value::as_str) {
        return Err(ProtocolError::Provider(msg.to_string()));
    }

    match stream {
        StreamType::Ticker => {
            let event: TickerEvent = serde_json::from_value(value)?;
            Ok(Some(InboundFrame::Ticker(Ticker {
                symbol: event.symbol,
                last_price: required("c", &event.last)?,
                open_24h: optional(event.open.as_ref()),
                high_24h: optional(event.high.as_ref()),
                low_24h: optional(event.low.as_ref()),
                volume_24h: optional(event.volume.as_ref()),
                best_bid: optional(event.bid.as_ref()),
                best_ask: optional(event.ask.as_ref()),
                timestamp_ms: timestamp(event.event_time.as_ref()),
            })))
        }
        StreamType::Depth => {
            if value.get("bids").is_none() && value.get("asks").is_none() {
                return Err(ProtocolError::UnknownFrame);
            }
            let depth: RawDepth = serde_json::from_value(value)?;
            Ok(Some(InboundFrame::Depth(depth)))
        }
        StreamType::Trade => {
            let event: TradeEvent = serde_json::from_value(value)?;
            let side = if event.buyer_is_maker {
                Side::Sell
            } else {
                Side::Buy
            };
            Ok(Some(InboundFrame::Trades(vec![Trade {
                price: required("p", &event.price)?,
                quantity: required("q", &event.quantity)?,
                side,
                timestamp_ms: timestamp(Some(&event.trade_time))
                    .ok_or(ProtocolError::InvalidNumber("T"))?,
            }])))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order_book::OrderBookNormalizer;

    #[test]
    fn targets_per_stream() {
        let pair = TradingPair::new("ETH", "USDT");
        assert_eq!(
            target(StreamType::Ticker, &pair),
            "wss://stream.binance.com:9443/ws/ethusdt@ticker"
        );
        assert_eq!(
            target(StreamType::Trade, &pair),
            "wss://stream.binance.com:9443/ws/ethusdt@trade"
        );
    }

    #[test]
    fn decodes_ticker() {
        let text = r#"{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"43000.5","o":"42000","h":"43500","l":"41800","v":"1234.5","b":"43000.4","a":"43000.6"}"#;
        let Some(InboundFrame::Ticker(ticker)) = decode(StreamType::Ticker, text).unwrap() else {
            panic!("expected ticker");
        };
        assert_eq!(ticker.symbol, "BTCUSDT");
        assert_eq!(ticker.last_price, 43_000.5);
        assert_eq!(ticker.best_ask, Some(43_000.6));
        assert_eq!(ticker.timestamp_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn decodes_partial_book() {
        let text = r#"{"lastUpdateId":160,"bids":[["0.0024","10"],["0.0025","0"]],"asks":[["0.0026","100"]]}"#;
        let Some(InboundFrame::Depth(raw)) = decode(StreamType::Depth, text).unwrap() else {
            panic!("expected depth");
        };
        let book = OrderBookNormalizer::default().normalize(&raw);
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.asks.len(), 1);
    }

    #[test]
    fn decodes_trade_side_from_maker_flag() {
        let text = r#"{"e":"trade","E":1,"s":"BTCUSDT","t":12345,"p":"43000.1","q":"0.01","T":1700000000001,"m":true}"#;
        let Some(InboundFrame::Trades(trades)) = decode(StreamType::Trade, text).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Sell);
        assert_eq!(trades[0].timestamp_ms, 1_700_000_000_001);
    }

    #[test]
    fn subscribe_ack_is_control_frame() {
        assert_eq!(
            decode(StreamType::Trade, r#"{"result":null,"id":1}"#).unwrap(),
            None
        );
    }

    #[test]
    fn malformed_payloads_fail() {
        assert!(decode(StreamType::Trade, r#"{"p":"abc","q":"1","T":1,"m":false}"#).is_err());
        assert!(decode(StreamType::Depth, r#"{"foo":1}"#).is_err());
        assert!(matches!(
            decode(StreamType::Ticker, r#"{"code":-1100,"msg":"Illegal characters"}"#),
            Err(ProtocolError::Provider(_))
        ));
    }
}
