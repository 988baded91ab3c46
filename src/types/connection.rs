//! Connection lifecycle types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current state of the broker connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted or the initial attempt failed.
    Errored,
}

impl ConnectionState {
    /// Whether a connect attempt is already under way or done.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

/// Lifecycle events published by the connection actor.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Close { reason: String },
    /// Transport error. Does not by itself change the connection state.
    Error { message: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// All reconnect attempts failed.
    Failed,
}
