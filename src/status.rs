//! Connection status record shared between a channel and its observers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Reconnection state machine phase.
///
/// `Idle -> Connecting -> Connected -> Reconnecting(n) -> Connecting -> ...`,
/// ending in `Exhausted` once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Waiting for the backoff timer before the next automatic attempt.
    Reconnecting,
    Exhausted,
}

/// Snapshot of one connection's health.
///
/// Only the owning [`crate::connection::Connection`] mutates this; observers
/// receive clones through status subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connecting: bool,
    pub error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub phase: LinkPhase,
}

impl ConnectionStatus {
    /// Connected and not carrying a server or transport error.
    pub fn is_healthy(&self) -> bool {
        self.connected && self.error.is_none()
    }

    pub(crate) fn set_phase(&mut self, phase: LinkPhase) {
        self.phase = phase;
        self.connected = phase == LinkPhase::Connected;
        self.connecting = phase == LinkPhase::Connecting;
    }
}
