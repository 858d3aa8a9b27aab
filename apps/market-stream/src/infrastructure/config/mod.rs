//! Configuration Module
//!
//! Configuration loading for the market stream service.

mod settings;

pub use settings::{
    BreakerSettings, BroadcastSettings, CoalescingSettings, ConfigError, HeartbeatSettings,
    ReconnectSettings, ServerSettings, StreamConfig,
};
