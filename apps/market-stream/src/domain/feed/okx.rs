//! OKX v5 public streams.
//!
//! Single endpoint; each socket subscribes to one `{channel, instId}` arg.
//! `books5` pushes full five-level snapshots. Keepalive replies are the bare
//! text `pong`.

use serde::Deserialize;
use serde_json::json;

use super::{InboundFrame, ProtocolError, optional, required, side_from, timestamp};
use crate::domain::market::{StreamType, Ticker, Trade, TradingPair};
use crate::domain::order_book::{RawDepth, RawLevel, RawNumber};

const URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

fn inst_id(pair: &TradingPair) -> String {
    format!("{}-{}", pair.base(), pair.quote())
}

const fn channel(stream: StreamType) -> &'static str {
    match stream {
        StreamType::Ticker => "tickers",
        StreamType::Depth => "books5",
        StreamType::Trade => "trades",
    }
}

pub(super) fn target(_stream: StreamType, _pair: &TradingPair) -> String {
    URL.to_string()
}

pub(super) fn subscribe_message(stream: StreamType, pair: &TradingPair) -> String {
    json!({
        "op": "subscribe",
        "args": [{ "channel": channel(stream), "instId": inst_id(pair) }],
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: Option<String>,
    code: Option<String>,
    msg: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    inst_id: String,
    last: RawNumber,
    #[serde(rename = "open24h")]
    open_24h: Option<RawNumber>,
    #[serde(rename = "high24h")]
    high_24h: Option<RawNumber>,
    #[serde(rename = "low24h")]
    low_24h: Option<RawNumber>,
    #[serde(rename = "vol24h")]
    vol_24h: Option<RawNumber>,
    bid_px: Option<RawNumber>,
    ask_px: Option<RawNumber>,
    ts: Option<RawNumber>,
}

#[derive(Debug, Deserialize)]
struct BookData {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    px: RawNumber,
    sz: RawNumber,
    side: String,
    ts: RawNumber,
}

pub(super) fn decode(stream: StreamType, text: &str) -> Result<Option<InboundFrame>, ProtocolError> {
    if text.trim() == "pong" {
        return Ok(None);
    }
    let envelope: Envelope = serde_json::from_str(text)?;

    if let Some(event) = envelope.event.as_deref() {
        return if event == "error" {
            Err(ProtocolError::Provider(format!(
                "{} {}",
                envelope.code.unwrap_or_default(),
                envelope.msg.unwrap_or_default()
            )))
        } else {
            Ok(None)
        };
    }
    if envelope.data.is_empty() {
        return Err(ProtocolError::UnknownFrame);
    }

    match stream {
        StreamType::Ticker => {
            let last = envelope.data.into_iter().last().ok_or(ProtocolError::UnknownFrame)?;
            let ticker: TickerData = serde_json::from_value(last)?;
            Ok(Some(InboundFrame::Ticker(Ticker {
                symbol: ticker.inst_id,
                last_price: required("last", &ticker.last)?,
                open_24h: optional(ticker.open_24h.as_ref()),
                high_24h: optional(ticker.high_24h.as_ref()),
                low_24h: optional(ticker.low_24h.as_ref()),
                volume_24h: optional(ticker.vol_24h.as_ref()),
                best_bid: optional(ticker.bid_px.as_ref()),
                best_ask: optional(ticker.ask_px.as_ref()),
                timestamp_ms: timestamp(ticker.ts.as_ref()),
            })))
        }
        StreamType::Depth => {
            let last = envelope.data.into_iter().last().ok_or(ProtocolError::UnknownFrame)?;
            let book: BookData = serde_json::from_value(last)?;
            Ok(Some(InboundFrame::Depth(RawDepth {
                bids: book.bids,
                asks: book.asks,
            })))
        }
        StreamType::Trade => {
            let trades = envelope
                .data
                .into_iter()
                .map(|row| {
                    let row: TradeData = serde_json::from_value(row)?;
                    Ok(Trade {
                        price: required("px", &row.px)?,
                        quantity: required("sz", &row.sz)?,
                        side: side_from(&row.side)?,
                        timestamp_ms: timestamp(Some(&row.ts))
                            .ok_or(ProtocolError::InvalidNumber("ts"))?,
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
    fn subscribe_frame_names_channel_and_instrument() {
        let frame: serde_json::Value = serde_json::from_str(&subscribe_message(
            StreamType::Depth,
            &TradingPair::new("eth", "usdt"),
        ))
        .unwrap();
        assert_eq!(
            frame,
            json!({ "op": "subscribe", "args": [{ "channel": "books5", "instId": "ETH-USDT" }] })
        );
    }

    #[test]
    fn control_frames() {
        assert_eq!(decode(StreamType::Ticker, "pong").unwrap(), None);
        let ack = r#"{"event":"subscribe","arg":{"channel":"tickers","instId":"BTC-USDT"},"connId":"a4d3ae55"}"#;
        assert_eq!(decode(StreamType::Ticker, ack).unwrap(), None);
        let error = r#"{"event":"error","code":"60012","msg":"Invalid request"}"#;
        assert_eq!(
            decode(StreamType::Ticker, error),
            Err(ProtocolError::Provider("60012 Invalid request".to_string()))
        );
    }

    #[test]
    fn decodes_ticker() {
        let text = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT"},"data":[{"instType":"SPOT","instId":"BTC-USDT","last":"9999.99","askPx":"10000.1","bidPx":"9999.9","open24h":"9000","high24h":"10500","low24h":"8900","vol24h":"2222","ts":"1597026383085"}]}"#;
        let Some(InboundFrame::Ticker(ticker)) = decode(StreamType::Ticker, text).unwrap() else {
            panic!("expected ticker");
        };
        assert_eq!(ticker.symbol, "BTC-USDT");
        assert_eq!(ticker.best_bid, Some(9_999.9));
        assert_eq!(ticker.timestamp_ms, Some(1_597_026_383_085));
    }

    #[test]
    fn decodes_books5_snapshot() {
        let text = r#"{"arg":{"channel":"books5","instId":"BTC-USDT"},"data":[{"asks":[["8476.98","415","0","13"]],"bids":[["8476.97","256","0","12"]],"instId":"BTC-USDT","ts":"1597026383085"}]}"#;
        let Some(InboundFrame::Depth(raw)) = decode(StreamType::Depth, text).unwrap() else {
            panic!("expected depth");
        };
        assert_eq!(raw.bids.len(), 1);
        assert_eq!(raw.asks.len(), 1);
    }

    #[test]
    fn decodes_trades() {
        let text = r#"{"arg":{"channel":"trades","instId":"BTC-USDT"},"data":[{"instId":"BTC-USDT","tradeId":"130639474","px":"42219.9","sz":"0.12060306","side":"buy","ts":"1630048897897"}]}"#;
        let Some(InboundFrame::Trades(trades)) = decode(StreamType::Trade, text).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(trades[0].side, Side::Buy);
        assert_eq!(trades[0].timestamp_ms, 1_630_048_897_897);
    }

    #[test]
    fn empty_data_is_unknown() {
        assert_eq!(
            decode(StreamType::Trade, r#"{"arg":{"channel":"trades"},"data":[]}"#),
            Err(ProtocolError::UnknownFrame)
        );
    }
}
