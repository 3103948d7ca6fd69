//! Gapless scheduling of decoded model speech.
//!
//! Every chunk is placed at `max(cursor, now)` on the playback port's audio
//! clock and the cursor then advances by exactly the chunk's duration. Chunks
//! that arrive faster than real time queue back-to-back; chunks that arrive
//! late start "now" and leave a jitter gap instead of overlapping.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::audio::port::{ChunkId, PlaybackPort};
use crate::buffering::chunk::PlaybackChunk;
use crate::error::Result;

/// Where and for how long one chunk was placed on the audio clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: ChunkId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Owns the playback port, the scheduling cursor and the active set.
pub struct PlaybackScheduler {
    port: Box<dyn PlaybackPort>,
    cursor: f64,
    active: BTreeMap<ChunkId, ScheduledChunk>,
    next_id: ChunkId,
}

impl PlaybackScheduler {
    pub fn new(port: Box<dyn PlaybackPort>) -> Self {
        Self {
            port,
            cursor: 0.0,
            active: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Place `chunk` directly after everything already scheduled.
    ///
    /// Returns `Ok(None)` for an empty chunk, which is not scheduled.
    ///
    /// # Errors
    /// Propagates the port's `Playback` error; the cursor is left untouched.
    pub fn schedule(&mut self, chunk: &PlaybackChunk) -> Result<Option<ScheduledChunk>> {
        if chunk.is_empty() {
            trace!("skipping empty playback chunk");
            return Ok(None);
        }

        let id = self.next_id;
        self.next_id += 1;

        let requested = self.cursor.max(self.port.now());
        let duration = chunk.duration_secs();
        // The clock may pass `requested` before the port queues the chunk.
        let start_at = self.port.schedule(id, chunk, requested)?.max(requested);

        self.cursor = start_at + duration;
        let scheduled = ScheduledChunk {
            id,
            start_at,
            duration,
        };
        self.active.insert(id, scheduled);
        trace!(id, start_at, duration, cursor = self.cursor, "chunk scheduled");
        Ok(Some(scheduled))
    }

    /// Natural completion of a chunk. Returns `false` for ids that are not
    /// active (already stopped or never scheduled).
    pub fn complete(&mut self, id: ChunkId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Silence every scheduled chunk, empty the active set and reset the cursor.
    pub fn stop_all(&mut self) {
        if !self.active.is_empty() {
            let ids: Vec<ChunkId> = self.active.keys().copied().collect();
            self.port.stop(&ids);
            debug!(stopped = ids.len(), "playback interrupted");
        }
        self.active.clear();
        self.cursor = 0.0;
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Stop everything and release the output device. Idempotent.
    pub fn close(&mut self) {
        self.stop_all();
        self.port.close();
    }
}
