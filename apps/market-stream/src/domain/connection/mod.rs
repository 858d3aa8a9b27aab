//! Connection Lifecycle Types
//!
//! Per-subscription connection state, statistics and the error taxonomy used
//! to decide between retrying, dropping and parking a subscription.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::domain::feed::ProtocolError;

/// WebSocket close code for an intentional, normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport and no pending reconnect.
    #[default]
    Disconnected,
    /// Transport requested, not yet open.
    Connecting,
    /// Transport open and handshake sent.
    Connected,
    /// Waiting for a backoff timer before the next attempt.
    Reconnecting,
    /// Retries exhausted; parked until resubscribed.
    Failed,
}

impl ConnectionState {
    /// Whether the subscription currently holds, or is about to hold, a transport.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Numeric value exported on the connection state gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
            Self::Failed => 4.0,
        }
    }

    /// State name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure observed on a subscription.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    /// Network drop or abnormal close; retried per policy.
    #[error("transient failure (code {code}): {reason}")]
    Transient {
        /// Close code, [`ABNORMAL_CLOSURE`] when none was received.
        code: u16,
        /// Close reason or transport error text.
        reason: String,
    },

    /// Malformed frame; dropped without closing the connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Post-connect subscribe message could not be delivered.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Reconnect attempts reached the policy maximum.
    #[error("retries exhausted after {attempts} attempts")]
    ExhaustedRetries {
        /// Reconnect attempts made.
        attempts: u32,
    },

    /// Attempt suppressed by an open circuit breaker.
    #[error("circuit open for service {service}")]
    CircuitOpen {
        /// Breaker service name.
        service: String,
    },
}

impl FeedError {
    /// Whether this failure should lead to another connection attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Handshake(_) | Self::CircuitOpen { .. }
        )
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-subscription connection statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Connection attempts made. Never reset.
    pub attempts: u64,
    /// Most recent failure.
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<FeedError>,
    /// When the transport last opened.
    pub last_connected_at: Option<DateTime<Utc>>,
}

fn serialize_error<S: Serializer>(error: &Option<FeedError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Failed.is_active());
    }

    #[test]
    fn retryable_errors() {
        assert!(
            FeedError::Transient {
                code: ABNORMAL_CLOSURE,
                reason: "reset".to_string()
            }
            .is_retryable()
        );
        assert!(FeedError::Handshake("send failed".to_string()).is_retryable());
        assert!(!FeedError::ExhaustedRetries { attempts: 3 }.is_retryable());
        assert!(!FeedError::Protocol(ProtocolError::UnknownFrame).is_retryable());
    }

    #[test]
    fn stats_serialize_error_as_text() {
        let stats = ConnectionStats {
            attempts: 2,
            last_error: Some(FeedError::CircuitOpen {
                service: "market-stream".to_string(),
            }),
            last_connected_at: None,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["attempts"], 2);
        assert_eq!(json["last_error"], "circuit open for service market-stream");
        assert!(json["last_connected_at"].is_null());
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
    }
}
