//! Heartbeat Monitor
//!
//! Keeps a WebSocket honest with periodic pings. If a ping goes unanswered
//! for longer than the timeout the transport is declared dead, which the
//! supervisor then sees as an abnormal close.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::HeartbeatSettings;

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Time a ping may go unanswered.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatSettings::default().into()
    }
}

impl From<HeartbeatSettings> for HeartbeatConfig {
    fn from(settings: HeartbeatSettings) -> Self {
        Self {
            ping_interval: settings.interval,
            pong_timeout: settings.timeout,
        }
    }
}

/// What the monitor asks the socket task to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame.
    SendPing,
    /// The peer stopped answering.
    Timeout,
}

/// Liveness shared between the monitor and the socket task.
#[derive(Debug)]
pub struct HeartbeatState {
    last_seen: RwLock<Instant>,
    awaiting_pong: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Fresh state, counting the peer as seen now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen: RwLock::new(Instant::now()),
            awaiting_pong: AtomicBool::new(false),
        }
    }

    /// Any inbound frame proves the peer is alive.
    pub fn record_activity(&self) {
        *self.last_seen.write() = Instant::now();
        self.awaiting_pong.store(false, Ordering::SeqCst);
    }

    /// Note that a ping went out.
    pub fn mark_ping_sent(&self) {
        self.awaiting_pong.store(true, Ordering::SeqCst);
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong.load(Ordering::SeqCst)
    }

    /// Time since the peer was last heard from.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_seen.read().elapsed()
    }
}

/// Periodic ping and timeout detection for one socket.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a monitor reporting to `event_tx`.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or a timeout is reported.
    pub async fn run(self) {
        let start = Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> bool {
        if self.state.is_awaiting_pong() {
            let silence = self.state.silence();
            if silence > self.config.pong_timeout {
                tracing::warn!(
                    silence_ms = silence.as_millis(),
                    timeout_ms = self.config.pong_timeout.as_millis(),
                    "Heartbeat timeout"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                return false;
            }
        }

        self.event_tx.send(HeartbeatEvent::SendPing).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(
        ping: u64,
        timeout: u64,
    ) -> (
        HeartbeatMonitor,
        Arc<HeartbeatState>,
        mpsc::Receiver<HeartbeatEvent>,
        CancellationToken,
    ) {
        let config = HeartbeatConfig {
            ping_interval: Duration::from_millis(ping),
            pong_timeout: Duration::from_millis(timeout),
        };
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(config, state.clone(), event_tx, cancel.clone());
        (monitor, state, event_rx, cancel)
    }

    #[test]
    fn defaults_follow_settings() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.pong_timeout, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_clears_outstanding_ping() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        assert!(state.is_awaiting_pong());

        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(state.silence(), Duration::from_millis(30));

        state.record_activity();
        assert!(!state.is_awaiting_pong());
        assert_eq!(state.silence(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_each_interval() {
        let (monitor, _state, mut events, cancel) = monitor(50, 1_000);
        let task = tokio::spawn(monitor.run());

        assert_eq!(events.recv().await, Some(HeartbeatEvent::SendPing));
        assert_eq!(events.recv().await, Some(HeartbeatEvent::SendPing));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_times_out() {
        let (monitor, state, mut events, _cancel) = monitor(50, 100);
        state.mark_ping_sent();
        let task = tokio::spawn(monitor.run());

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }

        assert_eq!(seen.last(), Some(&HeartbeatEvent::Timeout));
        task.await.unwrap();
    }
}
