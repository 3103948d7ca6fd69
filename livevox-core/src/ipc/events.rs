//! Event types published by the engine to its host.
//!
//! ## Streams
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStateEvent` | `VoiceEngine::subscribe_state` |
//! | `LevelEvent` | `VoiceEngine::subscribe_level` |
//! | `SessionErrorEvent` | `VoiceEngine::subscribe_errors` |
//!
//! All types serialize to camelCase JSON so a UI layer can forward them as-is.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, LiveVoxError};

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Lifecycle of one voice session.
///
/// ```text
/// Idle ─► Connecting ─► Active ─► Ending ─► Closed
///            │            │  ▲
///            │            └──┘ (interruption)
///            └─────────┬──────────────► Ending
///   any non-terminal ──┴─► Error ─► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Ending,
    Closed,
    Error,
}

impl SessionState {
    /// `Closed` is the only terminal state.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether the controller is allowed to move from `self` to `next`.
    ///
    /// The `Active → Active` interruption loop is not a state change and is
    /// therefore not listed.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Active) => true,
            (Idle | Connecting | Active, Ending) => true,
            (Idle | Connecting | Active | Ending, Error) => true,
            (Ending | Error, Closed) => true,
            _ => false,
        }
    }
}

/// Published on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateEvent {
    pub session_id: u64,
    pub state: SessionState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Level meter
// ---------------------------------------------------------------------------

/// Published once per captured block while the session is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    /// Monotonically increasing per-session sequence number.
    pub seq: u64,
    /// Visualizer level in [0, 100].
    pub level: f32,
}

// ---------------------------------------------------------------------------
// Terminal error
// ---------------------------------------------------------------------------

/// Published at most once per session, after teardown, when it ends in `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorEvent {
    pub session_id: u64,
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionErrorEvent {
    pub fn from_error(session_id: u64, err: &LiveVoxError) -> Self {
        Self {
            session_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
