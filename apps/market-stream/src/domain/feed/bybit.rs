//! Bybit v5 public spot streams.
//!
//! Single endpoint; each socket sends one `{"op":"subscribe"}` frame naming
//! its topic. Order book topics push a snapshot followed by deltas.

use serde::Deserialize;
use serde_json::json;

use super::{InboundFrame, ProtocolError, optional, required, side_from, timestamp};
use crate::domain::market::{StreamType, Ticker, Trade, TradingPair};
use crate::domain::order_book::{RawDepth, RawLevel, RawNumber};

const URL: &str = "wss://stream.bybit.com/v5/public/spot";

fn topic(stream: StreamType, pair: &TradingPair) -> String {
    let symbol = format!("{}{}", pair.base(), pair.quote());
    match stream {
        StreamType::Ticker => format!("tickers.{symbol}"),
        StreamType::Depth => format!("orderbook.50.{symbol}"),
        StreamType::Trade => format!("publicTrade.{symbol}"),
    }
}

pub(super) fn target(_stream: StreamType, _pair: &TradingPair) -> String {
    URL.to_string()
}

pub(super) fn subscribe_message(stream: StreamType, pair: &TradingPair) -> String {
    json!({ "op": "subscribe", "args": [topic(stream, pair)] }).to_string()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    ts: Option<RawNumber>,
    data: Option<serde_json::Value>,
    op: Option<String>,
    success: Option<bool>,
    ret_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    symbol: String,
    last_price: RawNumber,
    prev_price24h: Option<RawNumber>,
    high_price24h: Option<RawNumber>,
    low_price24h: Option<RawNumber>,
    volume24h: Option<RawNumber>,
    bid1_price: Option<RawNumber>,
    ask1_price: Option<RawNumber>,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(rename = "b", default)]
    bids: Vec<RawLevel>,
    #[serde(rename = "a", default)]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(rename = "T")]
    time: RawNumber,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: RawNumber,
    #[serde(rename = "p")]
    price: RawNumber,
}

pub(super) fn decode(stream: StreamType, text: &str) -> Result<Option<InboundFrame>, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if envelope.op.is_some() || envelope.success.is_some() {
        return match envelope.success {
            Some(false) => Err(ProtocolError::Provider(
                envelope.ret_msg.unwrap_or_else(|| "request rejected".to_string()),
            )),
            _ => Ok(None),
        };
    }
    if envelope.topic.is_none() {
        return Err(ProtocolError::UnknownFrame);
    }
    let data = envelope.data.ok_or(ProtocolError::UnknownFrame)?;

    match stream {
        StreamType::Ticker => {
            let ticker: TickerData = serde_json::from_value(data)?;
            Ok(Some(InboundFrame::Ticker(Ticker {
                symbol: ticker.symbol,
                last_price: required("lastPrice", &ticker.last_price)?,
                open_24h: optional(ticker.prev_price24h.as_ref()),
                high_24h: optional(ticker.high_price24h.as_ref()),
                low_24h: optional(ticker.low_price24h.as_ref()),
                volume_24h: optional(ticker.volume24h.as_ref()),
                best_bid: optional(ticker.bid1_price.as_ref()),
                best_ask: optional(ticker.ask1_price.as_ref()),
                timestamp_ms: timestamp(envelope.ts.as_ref()),
            })))
        }
        StreamType::Depth => {
            let book: BookData = serde_json::from_value(data)?;
            let raw = RawDepth {
                bids: book.bids,
                asks: book.asks,
            };
            match envelope.kind.as_deref() {
                Some("delta") => Ok(Some(InboundFrame::DepthDelta(raw))),
                _ => Ok(Some(InboundFrame::Depth(raw))),
            }
        }
        StreamType::Trade => {
            let rows: Vec<TradeData> = serde_json::from_value(data)?;
            let trades = rows
                .iter()
                .map(|row| {
                    Ok(Trade {
                        price: required("p", &row.price)?,
                        quantity: required("v", &row.size)?,
                        side: side_from(&row.side)?,
                        timestamp_ms: timestamp(Some(&row.time))
                            .ok_or(ProtocolError::InvalidNumber("T"))?,
                    })
                })
                .collect::<Result<Vec<_>, ProtocolError>>()?;
            Ok(Some(InboundFrame::Trades(trades)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Side;

    #[test]
    fn subscribe_frame_per_stream() {
        let pair = TradingPair::new("BTC", "USDT");
        let frame: serde_json::Value =
            serde_json::from_str(&subscribe_message(StreamType::Depth, &pair)).unwrap();
        assert_eq!(
            frame,
            json!({ "op": "subscribe", "args": ["orderbook.50.BTCUSDT"] })
        );
        assert_eq!(target(StreamType::Ticker, &pair), URL);
    }

    #[test]
    fn ack_and_pong_are_control_frames() {
        let ack = r#"{"success":true,"ret_msg":"","conn_id":"abc","op":"subscribe"}"#;
        assert_eq!(decode(StreamType::Trade, ack).unwrap(), None);
        let pong = r#"{"success":true,"ret_msg":"pong","conn_id":"abc","op":"ping"}"#;
        assert_eq!(decode(StreamType::Trade, pong).unwrap(), None);
    }

    #[test]
    fn rejected_subscription_is_provider_error() {
        let nack = r#"{"success":false,"ret_msg":"Invalid symbol","op":"subscribe"}"#;
        assert_eq!(
            decode(StreamType::Ticker, nack),
            Err(ProtocolError::Provider("Invalid symbol".to_string()))
        );
    }

    #[test]
    fn decodes_snapshot_and_delta() {
        let snapshot = r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","ts":1,"data":{"s":"BTCUSDT","b":[["100","1"]],"a":[["101","2"]],"u":1}}"#;
        assert!(matches!(
            decode(StreamType::Depth, snapshot).unwrap(),
            Some(InboundFrame::Depth(_))
        ));
        let delta = r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":2,"data":{"s":"BTCUSDT","b":[["100","0"]],"a":[],"u":2}}"#;
        assert!(matches!(
            decode(StreamType::Depth, delta).unwrap(),
            Some(InboundFrame::DepthDelta(_))
        ));
    }

    #[test]
    fn decodes_trade_batch_in_order() {
        let text = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":3,"data":[
            {"T":10,"s":"BTCUSDT","S":"Buy","v":"0.1","p":"100.5","i":"a"},
            {"T":11,"s":"BTCUSDT","S":"Sell","v":"0.2","p":"100.4","i":"b"}
        ]}"#;
        let Some(InboundFrame::Trades(trades)) = decode(StreamType::Trade, text).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[1].timestamp_ms, 11);
    }

    #[test]
    fn decodes_ticker_with_previous_price_as_open() {
        let text = r#"{"topic":"tickers.BTCUSDT","ts":1700000000000,"type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"110","prevPrice24h":"100","highPrice24h":"111","lowPrice24h":"99","volume24h":"5"}}"#;
        let Some(InboundFrame::Ticker(ticker)) = decode(StreamType::Ticker, text).unwrap() else {
            panic!("expected ticker");
        };
        assert_eq!(ticker.open_24h, Some(100.0));
        assert!(ticker.best_bid.is_none());
        assert_eq!(ticker.timestamp_ms, Some(1_700_000_000_000));
    }
}
