//! Event types emitted to the presentation layer.
//!
//! | Event | Source |
//! |-------|--------|
//! | `ConnectionStatusEvent` | `ParleyEngine::subscribe_status` |
//! | `TurnEvent` | `ParleyEngine::subscribe_turns` |

use serde::{Deserialize, Serialize};

use crate::transcript::TurnRecord;

// ---------------------------------------------------------------------------
// Turn events
// ---------------------------------------------------------------------------

/// Changes to the conversation log, in log order.
///
/// `seq` increases monotonically across both variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TurnEvent {
    /// One finalized turn record was appended.
    Appended { seq: u64, record: TurnRecord },
    /// A new session emptied the log; anything shown so far is gone.
    Cleared { seq: u64 },
}

impl TurnEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Appended { seq, .. } | Self::Cleared { seq } => *seq,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection status events
// ---------------------------------------------------------------------------

/// Emitted whenever the session changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusEvent {
    pub state: ConnectionState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle state of the conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session. Initial state, and where stop always lands.
    Disconnected,
    /// Resources being acquired or waiting for the remote to open.
    Connecting,
    /// Streaming in both directions.
    Connected,
    /// Failed. A new start is the only way forward.
    Error,
}

impl ConnectionState {
    /// Whether a session exists that stop would tear down.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}
