//! Prometheus Metrics Module
//!
//! # Metrics Categories
//!
//! - **Frames**: upstream frames received and dropped, by provider and stream
//! - **Coalescing**: depth updates and trade batches delivered, trades evicted
//! - **Connections**: reconnect attempts, per-subscription state, breaker state
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording is a
//! no-op until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;
use crate::domain::market::{Provider, StreamType, SubscriptionId};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_stream_frames_received_total",
        "Frames received from upstream providers"
    );
    describe_counter!(
        "market_stream_frames_dropped_total",
        "Frames or payloads dropped as malformed or invalid"
    );
    describe_counter!(
        "market_stream_depth_updates_emitted_total",
        "Throttled order book updates delivered downstream"
    );
    describe_counter!(
        "market_stream_trade_batches_emitted_total",
        "Trade batches delivered downstream"
    );
    describe_counter!(
        "market_stream_trades_evicted_total",
        "Trades evicted from a full batch buffer"
    );
    describe_counter!(
        "market_stream_reconnects_total",
        "Reconnection attempts scheduled"
    );
    describe_gauge!(
        "market_stream_connection_state",
        "Subscription state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=failed)"
    );
    describe_gauge!(
        "market_stream_circuit_open",
        "Whether a circuit breaker is open (1) or closed (0)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from a provider.
pub fn record_frame_received(provider: Provider, stream: StreamType) {
    counter!(
        "market_stream_frames_received_total",
        "provider" => provider.as_str(),
        "stream" => stream.as_str()
    )
    .increment(1);
}

/// Record a dropped frame or payload.
pub fn record_frame_dropped(provider: Provider, stream: StreamType, reason: &'static str) {
    counter!(
        "market_stream_frames_dropped_total",
        "provider" => provider.as_str(),
        "stream" => stream.as_str(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a depth update delivered downstream.
pub fn record_depth_emitted(provider: Provider) {
    counter!(
        "market_stream_depth_updates_emitted_total",
        "provider" => provider.as_str()
    )
    .increment(1);
}

/// Record a trade batch delivered downstream.
pub fn record_trade_batch_emitted(provider: Provider) {
    counter!(
        "market_stream_trade_batches_emitted_total",
        "provider" => provider.as_str()
    )
    .increment(1);
}

/// Record a trade evicted from a full buffer.
pub fn record_trade_evicted(provider: Provider) {
    counter!(
        "market_stream_trades_evicted_total",
        "provider" => provider.as_str()
    )
    .increment(1);
}

/// Record a scheduled reconnection.
pub fn record_reconnect(provider: Provider, stream: StreamType) {
    counter!(
        "market_stream_reconnects_total",
        "provider" => provider.as_str(),
        "stream" => stream.as_str()
    )
    .increment(1);
}

/// Update the state gauge of a subscription.
///
/// Labelled by provider and stream only. One pair is live at a time, so a
/// symbol switch reuses the same series instead of adding new ones.
pub fn set_connection_state(id: &SubscriptionId, state: ConnectionState) {
    gauge!(
        "market_stream_connection_state",
        "provider" => id.provider.as_str(),
        "stream" => id.stream.as_str()
    )
    .set(state.as_gauge());
}

/// Update the open/closed gauge of a circuit breaker.
pub fn set_circuit_open(service: &str, open: bool) {
    gauge!(
        "market_stream_circuit_open",
        "service" => service.to_string()
    )
    .set(if open { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::TradingPair;

    fn state_series(rendered: &str) -> Vec<&str> {
        rendered
            .lines()
            .filter(|line| line.starts_with("market_stream_connection_state{"))
            .collect()
    }

    #[test]
    fn symbol_switch_reuses_connection_state_series() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            for base in ["BTC", "ETH", "SOL"] {
                let id = SubscriptionId::new(
                    Provider::Binance,
                    TradingPair::new(base, "USDT"),
                    StreamType::Ticker,
                );
                set_connection_state(&id, ConnectionState::Connected);
                set_connection_state(&id, ConnectionState::Disconnected);
            }
            let live = SubscriptionId::new(
                Provider::Binance,
                TradingPair::new("ETH", "USDT"),
                StreamType::Ticker,
            );
            set_connection_state(&live, ConnectionState::Connected);
        });

        let rendered = handle.render();
        let series = state_series(&rendered);
        assert_eq!(series.len(), 1, "{rendered}");
        assert!(series[0].contains(r#"provider="binance""#));
        assert!(series[0].contains(r#"stream="ticker""#));
        assert!(series[0].ends_with(" 2"));
    }
}
