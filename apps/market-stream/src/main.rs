//! Market Stream Binary
//!
//! Starts the connection supervisor for the configured symbol and serves
//! health and metrics over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_STREAM_SYMBOL`: trading pair (default: BTC/USDT)
//! - `MARKET_STREAM_PROVIDERS`: comma list of binance, bybit, okx (default: binance)
//! - `MARKET_STREAM_STREAMS`: comma list of ticker, depth, trade (default: all)
//! - `MARKET_STREAM_HEALTH_PORT`: health and metrics HTTP port (default: 8083)
//! - `MARKET_STREAM_RECONNECT_JITTER`: backoff jitter fraction, 0 to 1 (default: 0)
//! - `OTEL_ENABLED`: enable OpenTelemetry export (default: true)
//! - `RUST_LOG`: extra log directives

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
use market_stream::infrastructure::health::{HealthServer, HealthServerState};
use market_stream::infrastructure::telemetry;
use market_stream::infrastructure::transport::{HeartbeatConfig, WebSocketConnector};
use market_stream::{ConnectionSupervisor, StreamConfig, init_metrics};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Stream");

    let _metrics_handle = init_metrics();

    let config = StreamConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let broadcast_hub = Arc::new(BroadcastHub::new(BroadcastConfig::from(config.broadcast)));
    spawn_debug_tap(&broadcast_hub, shutdown_token.clone());

    let connector = Arc::new(WebSocketConnector::new(
        HeartbeatConfig::from(config.heartbeat),
        shutdown_token.child_token(),
    ));
    let (supervisor, supervisor_task) = ConnectionSupervisor::spawn(
        config.to_supervisor_config(),
        connector,
        Arc::clone(&broadcast_hub) as _,
        shutdown_token.child_token(),
    );

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        supervisor.clone(),
        Arc::clone(&broadcast_hub),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    supervisor
        .switch_symbol(config.symbol.clone())
        .await
        .context("supervisor stopped before the first subscription")?;

    tracing::info!(symbol = %config.symbol, "Market stream ready");

    await_signal().await;

    if let Err(e) = supervisor.shutdown().await {
        tracing::warn!(error = %e, "Supervisor already stopped");
    }
    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, supervisor_task)
        .await
        .is_err()
    {
        tracing::warn!("Supervisor did not stop in time");
    }

    tracing::info!("Market stream stopped");
    Ok(())
}

/// Log everything the hub delivers at debug level.
fn spawn_debug_tap(hub: &BroadcastHub, cancel: CancellationToken) {
    let mut tickers = hub.tickers_rx();
    let mut depth = hub.depth_rx();
    let mut trades = hub.trades_rx();
    let mut connections = hub.connections_rx();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                msg = tickers.recv() => match msg {
                    Ok(msg) => tracing::debug!(provider = %msg.provider, price = msg.ticker.last_price, "Ticker"),
                    Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "Ticker tap lagged"),
                    Err(RecvError::Closed) => break,
                },
                msg = depth.recv() => match msg {
                    Ok(msg) => tracing::debug!(
                        provider = %msg.provider,
                        bids = msg.book.bids.len(),
                        asks = msg.book.asks.len(),
                        spread = msg.book.spread(),
                        "Depth"
                    ),
                    Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "Depth tap lagged"),
                    Err(RecvError::Closed) => break,
                },
                msg = trades.recv() => match msg {
                    Ok(msg) => tracing::debug!(provider = %msg.provider, count = msg.trades.len(), "Trades"),
                    Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "Trade tap lagged"),
                    Err(RecvError::Closed) => break,
                },
                msg = connections.recv() => match msg {
                    Ok(msg) => tracing::info!(
                        subscription = %msg.id,
                        state = %msg.state,
                        attempts = msg.stats.attempts,
                        "Subscription state changed"
                    ),
                    Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "Connection tap lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    let providers: Vec<&str> = config.providers.iter().map(|p| p.as_str()).collect();
    let streams: Vec<&str> = config.streams.iter().map(|s| s.as_str()).collect();
    tracing::info!(
        symbol = %config.symbol,
        providers = ?providers,
        streams = ?streams,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        reconnect_base_ms = config.reconnect.base_delay.as_millis(),
        reconnect_max_ms = config.reconnect.max_delay.as_millis(),
        reconnect_jitter = config.reconnect.jitter_factor,
        breaker_threshold = config.breaker.failure_threshold,
        breaker_cooldown_ms = config.breaker.cooldown.as_millis(),
        depth_window_ms = config.coalescing.depth_window.as_millis(),
        trade_window_ms = config.coalescing.trade_window.as_millis(),
        "Resilience and coalescing settings"
    );
}

/// Wait for SIGINT or SIGTERM.
#[allow(clippy::expect_used)]
async fn await_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
