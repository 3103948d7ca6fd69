//! Stream liveness tracking for the device threads.
//!
//! Some backends stop invoking the stream callback without ever reporting an
//! error (revoked permission, a sleeping USB interface). Each port thread
//! feeds a `StallWatchdog` whenever its callback makes progress and treats a
//! silent stream as a device failure.

use std::time::{Duration, Instant};

/// Time without callback progress before a stream is declared dead.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Tracks the last time a stream made progress.
///
/// Disarmed watchdogs never report a stall; the capture side stays disarmed
/// until streaming begins.
#[derive(Debug, Clone)]
pub struct StallWatchdog {
    timeout: Duration,
    last_progress: Option<Instant>,
}

impl StallWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_progress: None,
        }
    }

    /// Record progress at `now`, arming the watchdog if needed.
    pub fn feed(&mut self, now: Instant) {
        self.last_progress = Some(now);
    }

    /// Arm at `now` unless already armed.
    pub fn arm(&mut self, now: Instant) {
        self.last_progress.get_or_insert(now);
    }

    pub fn disarm(&mut self) {
        self.last_progress = None;
    }

    pub fn is_armed(&self) -> bool {
        self.last_progress.is_some()
    }

    pub fn is_stalled(&self, now: Instant) -> bool {
        self.last_progress
            .is_some_and(|last| now.saturating_duration_since(last) >= self.timeout)
    }
}

impl Default for StallWatchdog {
    fn default() -> Self {
        Self::new(STALL_TIMEOUT)
    }
}

/// Describe a cpal stream error. Every variant is terminal for the stream.
#[cfg(feature = "audio-cpal")]
pub fn stream_fault(direction: &str, err: &cpal::StreamError) -> String {
    match err {
        cpal::StreamError::DeviceNotAvailable => format!("{direction} device disconnected"),
        cpal::StreamError::BackendSpecific { err } => {
            format!("{direction} stream failed: {}", err.description)
        }
    }
}
