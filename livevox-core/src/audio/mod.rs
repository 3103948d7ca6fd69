//! Audio capture and playback via the cpal backend.
//!
//! # Design constraints
//!
//! cpal input/output callbacks run on OS audio threads at elevated priority.
//! The input callback only mixes to mono and pushes into an SPSC ring buffer
//! (lock-free, allocation-free once warmed up). The output callback holds the
//! mixer lock only for the duration of one render.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each port therefore creates its stream on a dedicated thread, keeps
//! it there for the lifetime of the session, and drops it on that same thread.
//! A sync oneshot channel hands the open result back to the caller.

pub mod capture;
pub mod device;
pub mod output;
pub mod port;
pub mod resample;
pub mod watchdog;

pub use capture::{block_level, BlockAssembler, CaptureConfig};
pub use output::{Mixer, PlaybackConfig};
pub use port::{AudioBackend, CaptureEvent, CapturePort, ChunkId, PlaybackEvent, PlaybackPort};
pub use watchdog::{StallWatchdog, STALL_TIMEOUT};

#[cfg(feature = "audio-cpal")]
pub use capture::CpalCapture;
#[cfg(feature = "audio-cpal")]
pub use output::CpalPlayback;

/// Native audio backend: one cpal input stream and one cpal output stream per session.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

impl CpalBackend {
    pub fn new(capture: CaptureConfig, playback: PlaybackConfig) -> Self {
        Self { capture, playback }
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    fn capture(&self) -> Box<dyn CapturePort> {
        Box::new(CpalCapture::new(self.capture.clone()))
    }

    fn playback(&self) -> Box<dyn PlaybackPort> {
        Box::new(CpalPlayback::new(self.playback.clone()))
    }
}
