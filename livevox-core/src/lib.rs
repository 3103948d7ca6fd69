//! # livevox-core
//!
//! Real-time duplex voice session engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CpalCapture → SPSC RingBuffer → capture thread (resample, 4096-sample blocks)
//!                                                    │ CaptureEvent
//!                                             session controller ─encode_block──► DuplexChannel ──► model
//!                                                    ▲                                  │
//!                                          PlaybackScheduler ◄──decode_frame──── ChannelEvent
//!                                                    │
//!                                         CpalPlayback (Mixer) → Speaker
//! ```
//!
//! The capture callback only mixes to mono and pushes into the ring; all heap
//! work happens on the capture thread and the controller task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, CpalBackend};
pub use codec::{decode_frame, encode_block, TransportFrame};
pub use engine::{DiagnosticsSnapshot, SessionConfig, VoiceEngine};
pub use error::{ErrorKind, LiveVoxError, Result};
pub use ipc::events::{LevelEvent, SessionErrorEvent, SessionState, SessionStateEvent};
pub use playback::PlaybackScheduler;
pub use transport::live::{LiveConfig, LiveConnector};
pub use transport::{ChannelEvent, Connector, DuplexChannel};
