//! Depth throttling, trade batching and ticker passthrough through a live supervisor.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

mod common;

use common::{Delivery, Harness};
use market_stream::{
    Provider, Side, StreamType, SubscriptionId, SubscriptionSpec, SupervisorConfig, TradingPair,
};

fn pair() -> TradingPair {
    TradingPair::new("BTC", "USDT")
}

async fn connected(stream: StreamType) -> (Harness, SubscriptionId) {
    let harness = Harness::start(SupervisorConfig::default());
    let spec = SubscriptionSpec::streaming(Provider::Binance, pair(), stream);
    let id = spec.id.clone();
    harness.handle.subscribe(vec![spec]).await.unwrap();
    harness.connector.latest(&id).sink.open();
    harness.settle().await;
    (harness, id)
}

fn depth_frame(i: u32) -> String {
    format!(
        r#"{{"lastUpdateId":{i},"bids":[["{}","1"]],"asks":[["{}","1"]]}}"#,
        100 + i,
        200 + i
    )
}

fn trade_frame(i: u32) -> String {
    format!(
        r#"{{"e":"trade","E":1,"s":"BTCUSDT","t":{i},"p":"100.{i}","q":"0.5","T":{},"m":false}}"#,
        1_700_000_000_000_u64 + u64::from(i)
    )
}

#[tokio::test(start_paused = true)]
async fn depth_burst_collapses_to_latest_book() {
    let (harness, id) = connected(StreamType::Depth).await;
    let conn = harness.connector.latest(&id);

    for i in 0..50 {
        conn.sink.message(depth_frame(i));
        harness.wait(2).await;
    }
    harness.wait(100).await;

    let updates = harness.listener.depth_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].bids[0].price, 149.0);
    assert_eq!(updates[0].asks[0].price, 249.0);
}

#[tokio::test(start_paused = true)]
async fn quiet_depth_stream_emits_at_once() {
    let (harness, id) = connected(StreamType::Depth).await;
    harness.wait(500).await;

    harness.connector.latest(&id).sink.message(depth_frame(1));
    harness.settle().await;

    assert_eq!(harness.listener.depth_updates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn trades_arrive_as_one_ordered_batch() {
    let (harness, id) = connected(StreamType::Trade).await;
    let conn = harness.connector.latest(&id);

    for i in 0..10 {
        conn.sink.message(trade_frame(i));
        harness.wait(5).await;
    }
    assert!(harness.listener.trade_batches().is_empty());

    harness.wait(40).await;

    let batches = harness.listener.trade_batches();
    assert_eq!(batches.len(), 1);
    let stamps: Vec<i64> = batches[0].iter().map(|t| t.timestamp_ms).collect();
    let expected: Vec<i64> = (0..10).map(|i| 1_700_000_000_000 + i).collect();
    assert_eq!(stamps, expected);
    assert!(batches[0].iter().all(|t| t.side == Side::Buy));
}

#[tokio::test(start_paused = true)]
async fn ticker_passes_straight_through() {
    let (harness, id) = connected(StreamType::Ticker).await;

    harness
        .connector
        .latest(&id)
        .sink
        .message(r#"{"s":"BTCUSDT","c":"2","E":1}"#);
    harness.settle().await;

    let deliveries = harness.listener.deliveries();
    let Some(Delivery::Ticker(provider, ticker)) = deliveries.last() else {
        panic!("expected a ticker delivery, got {deliveries:?}");
    };
    assert_eq!(*provider, Provider::Binance);
    assert_eq!(ticker.last_price, 2.0);
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_flushes_pending_trades_once() {
    let (harness, id) = connected(StreamType::Trade).await;
    let conn = harness.connector.latest(&id);

    for i in 0..3 {
        conn.sink.message(trade_frame(i));
    }
    conn.sink.close(1006, "reset");
    harness.settle().await;
    assert_eq!(harness.listener.trade_batches().len(), 1);
    assert_eq!(harness.listener.trade_batches()[0].len(), 3);

    harness.wait(200).await;
    assert_eq!(harness.listener.trade_batches().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_closing() {
    let (harness, id) = connected(StreamType::Trade).await;
    let conn = harness.connector.latest(&id);

    conn.sink.message("not json");
    conn.sink.message(trade_frame(1));
    harness.wait(100).await;

    assert_eq!(harness.listener.trade_batches().len(), 1);
    assert!(conn.closed().is_none());
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.subscription(&id).unwrap().stats.last_error.is_some());
}
