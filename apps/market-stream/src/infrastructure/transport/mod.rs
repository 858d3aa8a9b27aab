//! Upstream Transports
//!
//! WebSocket implementation of the `FeedConnector` port and the heartbeat
//! monitor each socket runs.

pub mod heartbeat;
pub mod websocket;

pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use websocket::{WebSocketConnector, WebSocketHandle};
