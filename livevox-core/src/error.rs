use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by livevox-core.
#[derive(Debug, Error)]
pub enum LiveVoxError {
    /// Microphone unavailable, permission denied, or revoked mid-session.
    #[error("audio device error: {0}")]
    Device(String),

    /// Channel failed to open, errored, or closed unexpectedly.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or truncated inbound audio frame.
    #[error("transport decode error: {0}")]
    TransportDecode(String),

    /// Audio output device failure.
    #[error("playback error: {0}")]
    Playback(String),

    #[error("a voice session is already running")]
    AlreadyRunning,

    #[error("no voice session is running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LiveVoxError {
    /// Classification used by the terminal error event.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Device(_) => ErrorKind::Device,
            Self::Connection(_) => ErrorKind::Connection,
            Self::TransportDecode(_) => ErrorKind::TransportDecode,
            Self::Playback(_) => ErrorKind::Playback,
            Self::AlreadyRunning | Self::NotRunning | Self::Io(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Serializable error category carried by `SessionErrorEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Device,
    Connection,
    TransportDecode,
    Playback,
    Internal,
}

pub type Result<T> = std::result::Result<T, LiveVoxError>;
