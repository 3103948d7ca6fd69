//! Platform-neutral audio I/O boundary.
//!
//! The session controller only ever talks to these traits. `CpalCapture` and
//! `CpalPlayback` implement them over the native audio stack; tests drive the
//! controller with scripted implementations.
//!
//! Both ports report asynchronous happenings (a captured block, a finished
//! chunk, a device failure) as events on a tokio channel so the controller can
//! `select!` over them alongside the network.

use tokio::sync::mpsc;

use crate::buffering::chunk::{PlaybackChunk, SampleBlock};
use crate::error::{LiveVoxError, Result};

/// Identifier of one scheduled playback chunk, unique within a session.
pub type ChunkId = u64;

/// Events emitted by a capture port.
#[derive(Debug)]
pub enum CaptureEvent {
    /// One fixed-size block plus its visualizer level in [0, 100].
    Block { block: SampleBlock, level: f32 },
    /// The device failed; no further blocks will follow.
    Failed(LiveVoxError),
}

/// Events emitted by a playback port.
#[derive(Debug)]
pub enum PlaybackEvent {
    /// A chunk played to its natural end.
    Finished(ChunkId),
    /// The output device failed; no further audio will be rendered.
    Failed(LiveVoxError),
}

/// Microphone side of the audio boundary.
pub trait CapturePort: Send + 'static {
    /// Acquire the input device. Blocks until the device is open or has failed.
    ///
    /// Returns the effective device sample rate. No blocks are emitted until
    /// [`CapturePort::start_streaming`] is called.
    ///
    /// # Errors
    /// `LiveVoxError::Device` if the microphone is missing or access is denied.
    fn open(&mut self, events: mpsc::Sender<CaptureEvent>) -> Result<u32>;

    /// Begin emitting blocks. Idempotent.
    fn start_streaming(&mut self);

    /// Release the device. Idempotent; also performed on drop.
    fn close(&mut self);
}

/// Speaker side of the audio boundary.
///
/// Times are seconds on the port's own audio clock, which starts at 0 when the
/// port is opened and advances with rendered audio.
pub trait PlaybackPort: Send + 'static {
    /// Acquire the output device. Blocks until the device is open or has failed.
    ///
    /// Returns the effective device sample rate.
    ///
    /// # Errors
    /// `LiveVoxError::Playback` if no usable output device exists.
    fn open(&mut self, events: mpsc::UnboundedSender<PlaybackEvent>) -> Result<u32>;

    /// Current audio clock position in seconds.
    fn now(&self) -> f64;

    /// Queue `chunk` to begin at `start_at` on the audio clock.
    ///
    /// Returns the start actually used. It is later than `start_at` when the
    /// clock has already passed it by the time the chunk is queued.
    ///
    /// # Errors
    /// `LiveVoxError::Playback` if the port is not open.
    fn schedule(&mut self, id: ChunkId, chunk: &PlaybackChunk, start_at: f64) -> Result<f64>;

    /// Silence every listed chunk before the next rendered sample. Finished
    /// events are not reported for stopped chunks.
    fn stop(&mut self, ids: &[ChunkId]);

    /// Release the device. Idempotent; also performed on drop.
    fn close(&mut self);
}

/// Creates a fresh pair of ports for every session.
pub trait AudioBackend: Send + Sync + 'static {
    fn capture(&self) -> Box<dyn CapturePort>;
    fn playback(&self) -> Box<dyn PlaybackPort>;
}
