//! Typed audio blocks flowing through the session in both directions.

/// A fixed-length block of captured mono samples, ready for encoding.
///
/// Produced by the capture pump on its own thread; consumed (and dropped)
/// by the frame encoder.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    /// f32 samples in [-1.0, 1.0], interleaved if `channels > 1`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16000 on the outbound path).
    pub sample_rate: u32,
    /// Channel count. Always 1 in this system.
    pub channels: u16,
}

impl SampleBlock {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Returns the duration of this block in seconds.
    pub fn duration_secs(&self) -> f64 {
        let frames = self.samples.len() / usize::from(self.channels.max(1));
        frames as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A decoded audio buffer from the remote model, awaiting playback.
///
/// Samples are de-interleaved: `channels[c][i]` is frame `i` of channel `c`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl PlaybackChunk {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Frames per channel.
    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Returns the playback duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Mono downmix (channel average).
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frame_count())
                .map(|i| self.channels.iter().map(|ch| ch[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}
