//! Market Stream Configuration Settings
//!
//! Configuration types for the market stream service, loaded from environment
//! variables. Numeric values that fail to parse, or that are zero where zero
//! is meaningless, fall back to their defaults; unknown provider, stream or
//! symbol names are rejected.

use std::time::Duration;

use crate::application::services::SupervisorConfig;
use crate::domain::coalescing::{
    DEFAULT_DEPTH_WINDOW, DEFAULT_TRADE_CAPACITY, DEFAULT_TRADE_WINDOW, UpdateCoalescer,
};
use crate::domain::market::{Provider, StreamType, TradingPair};
use crate::domain::order_book::DEFAULT_DEPTH;
use crate::domain::resilience::{CircuitBreakerConfig, RetryPolicies, RetryPolicy};

/// Reconnection backoff for streaming subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect.
    pub base_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Delay cap.
    pub max_delay: Duration,
    /// Reconnect attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Jitter as a fraction of each delay (0 = deterministic).
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let policy = RetryPolicy::streaming();
        Self {
            base_delay: policy.base_delay,
            multiplier: policy.multiplier,
            max_delay: policy.max_delay,
            max_attempts: 0,
            jitter_factor: policy.jitter_factor,
        }
    }
}

impl ReconnectSettings {
    /// Streaming retry policy built from these settings.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: if self.max_attempts == 0 {
                u32::MAX
            } else {
                self.max_attempts
            },
            base_delay: self.base_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open after the last failure.
    pub cooldown: Duration,
    /// Umbrella service name.
    pub service: String,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
            service: "market-stream".to_string(),
        }
    }
}

/// Coalescing windows and order book depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescingSettings {
    /// Depth throttle window.
    pub depth_window: Duration,
    /// Trade batch window.
    pub trade_window: Duration,
    /// Maximum buffered trades per subscription.
    pub trade_buffer: usize,
    /// Order book levels kept per side.
    pub depth_levels: usize,
}

impl Default for CoalescingSettings {
    fn default() -> Self {
        Self {
            depth_window: DEFAULT_DEPTH_WINDOW,
            trade_window: DEFAULT_TRADE_WINDOW,
            trade_buffer: DEFAULT_TRADE_CAPACITY,
            depth_levels: DEFAULT_DEPTH,
        }
    }
}

/// WebSocket heartbeat settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Ping interval.
    pub interval: Duration,
    /// Time without a pong before the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Broadcast channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Capacity of the ticker channel.
    pub tickers_capacity: usize,
    /// Capacity of the depth channel.
    pub depth_capacity: usize,
    /// Capacity of the trade batch channel.
    pub trades_capacity: usize,
    /// Capacity of the connection change channel.
    pub connections_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            tickers_capacity: 1_000,
            depth_capacity: 1_000,
            trades_capacity: 1_000,
            connections_capacity: 256,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Providers to subscribe.
    pub providers: Vec<Provider>,
    /// Stream types to subscribe per provider.
    pub streams: Vec<StreamType>,
    /// Initial trading pair.
    pub symbol: TradingPair,
    /// Server port settings.
    pub server: ServerSettings,
    /// Reconnection backoff.
    pub reconnect: ReconnectSettings,
    /// Circuit breaker.
    pub breaker: BreakerSettings,
    /// Coalescing windows.
    pub coalescing: CoalescingSettings,
    /// WebSocket heartbeat.
    pub heartbeat: HeartbeatSettings,
    /// Broadcast channel capacities.
    pub broadcast: BroadcastSettings,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            providers: vec![Provider::Binance],
            streams: StreamType::all().to_vec(),
            symbol: TradingPair::new("BTC", "USDT"),
            server: ServerSettings::default(),
            reconnect: ReconnectSettings::default(),
            breaker: BreakerSettings::default(),
            coalescing: CoalescingSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            broadcast: BroadcastSettings::default(),
        }
    }
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider, stream or symbol name is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider, stream or symbol name is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let defaults = Self::default();

        let providers = match env.get("MARKET_STREAM_PROVIDERS") {
            Some(raw) => parse_list("MARKET_STREAM_PROVIDERS", &raw, |s| {
                Provider::from_str_case_insensitive(s)
            })?,
            None => defaults.providers,
        };

        let streams = match env.get("MARKET_STREAM_STREAMS") {
            Some(raw) => parse_list("MARKET_STREAM_STREAMS", &raw, |s| {
                StreamType::from_str_case_insensitive(s)
            })?,
            None => defaults.streams,
        };

        let symbol = match env.get("MARKET_STREAM_SYMBOL") {
            Some(raw) => TradingPair::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "MARKET_STREAM_SYMBOL".to_string(),
                value: raw,
            })?,
            None => defaults.symbol,
        };

        let server = ServerSettings {
            health_port: env.nonzero("MARKET_STREAM_HEALTH_PORT", defaults.server.health_port),
        };

        let reconnect = ReconnectSettings {
            base_delay: env.millis(
                "MARKET_STREAM_RECONNECT_BASE_MS",
                defaults.reconnect.base_delay,
            ),
            multiplier: env.parse_where(
                "MARKET_STREAM_RECONNECT_MULTIPLIER",
                defaults.reconnect.multiplier,
                |m| m.is_finite() && *m >= 1.0,
            ),
            max_delay: env.millis(
                "MARKET_STREAM_RECONNECT_MAX_MS",
                defaults.reconnect.max_delay,
            ),
            max_attempts: env.parse(
                "MARKET_STREAM_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
            jitter_factor: env.parse_where(
                "MARKET_STREAM_RECONNECT_JITTER",
                defaults.reconnect.jitter_factor,
                |j| (0.0..=1.0).contains(j),
            ),
        };

        let breaker = BreakerSettings {
            failure_threshold: env.nonzero(
                "MARKET_STREAM_BREAKER_THRESHOLD",
                defaults.breaker.failure_threshold,
            ),
            cooldown: env.millis(
                "MARKET_STREAM_BREAKER_COOLDOWN_MS",
                defaults.breaker.cooldown,
            ),
            service: env
                .get("MARKET_STREAM_BREAKER_SERVICE")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.breaker.service),
        };

        let coalescing = CoalescingSettings {
            depth_window: env.millis(
                "MARKET_STREAM_DEPTH_WINDOW_MS",
                defaults.coalescing.depth_window,
            ),
            trade_window: env.millis(
                "MARKET_STREAM_TRADE_WINDOW_MS",
                defaults.coalescing.trade_window,
            ),
            trade_buffer: env.nonzero(
                "MARKET_STREAM_TRADE_BUFFER",
                defaults.coalescing.trade_buffer,
            ),
            depth_levels: env.nonzero(
                "MARKET_STREAM_DEPTH_LEVELS",
                defaults.coalescing.depth_levels,
            ),
        };

        let heartbeat = HeartbeatSettings {
            interval: env.secs(
                "MARKET_STREAM_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat.interval,
            ),
            timeout: env.secs(
                "MARKET_STREAM_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat.timeout,
            ),
        };

        let broadcast = BroadcastSettings {
            tickers_capacity: env.nonzero(
                "MARKET_STREAM_TICKERS_CAPACITY",
                defaults.broadcast.tickers_capacity,
            ),
            depth_capacity: env.nonzero(
                "MARKET_STREAM_DEPTH_CAPACITY",
                defaults.broadcast.depth_capacity,
            ),
            trades_capacity: env.nonzero(
                "MARKET_STREAM_TRADES_CAPACITY",
                defaults.broadcast.trades_capacity,
            ),
            connections_capacity: env.nonzero(
                "MARKET_STREAM_CONNECTIONS_CAPACITY",
                defaults.broadcast.connections_capacity,
            ),
        };

        Ok(Self {
            providers,
            streams,
            symbol,
            server,
            reconnect,
            breaker,
            coalescing,
            heartbeat,
            broadcast,
        })
    }

    /// Supervisor configuration derived from these settings.
    #[must_use]
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            policies: RetryPolicies {
                streaming: self.reconnect.to_policy(),
                request: RetryPolicy::request(),
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                cooldown: self.breaker.cooldown,
            },
            breaker_service: self.breaker.service.clone(),
            coalescer: UpdateCoalescer {
                depth_window: self.coalescing.depth_window,
                trade_window: self.coalescing.trade_window,
                trade_capacity: self.coalescing.trade_buffer,
            },
            depth_levels: self.coalescing.depth_levels,
            providers: self.providers.clone(),
            streams: self.streams.clone(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value could not be interpreted.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Environment variable.
        key: String,
        /// Offending value.
        value: String,
    },
    /// A list variable was set but named nothing.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn parse_where<T: std::str::FromStr>(
        &self,
        key: &str,
        default: T,
        valid: impl Fn(&T) -> bool,
    ) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .filter(|v| valid(v))
            .unwrap_or(default)
    }

    fn nonzero<T: std::str::FromStr + Default + PartialEq>(&self, key: &str, default: T) -> T {
        self.parse_where(key, default, |v| *v != T::default())
    }

    // Every duration setting is a window, delay or timeout; zero is never usable.
    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map_or(default, Duration::from_millis)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map_or(default, Duration::from_secs)
    }
}

fn parse_list<T: PartialEq>(
    key: &str,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, ConfigError> {
    let mut items = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let item = parse(part).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: part.to_string(),
        })?;
        if !items.contains(&item) {
            items.push(item);
        }
    }
    if items.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(items)
}
