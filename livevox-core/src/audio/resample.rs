//! Audio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! The remote model speaks 16 kHz in and 24 kHz out, but many devices only
//! run at 44.1 or 48 kHz. `RateConverter` bridges the input side as a
//! streaming converter on the capture pump; `resample_whole` converts one
//! complete playback chunk to the output device rate.
//!
//! When both rates match, no rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, ResamplerConstructionError, Resampler};
use tracing::error;

/// Input frames per rubato call for whole-chunk conversion.
const WHOLE_CHUNK: usize = 1024;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter for `from_rate` → `to_rate` with `chunk_size`
    /// input frames per rubato call.
    ///
    /// # Errors
    /// Returns the rubato construction error for unsupported ratios.
    pub fn new(
        from_rate: u32,
        to_rate: u32,
        chunk_size: usize,
    ) -> Result<Self, ResamplerConstructionError> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        tracing::debug!(from_rate, to_rate, chunk_size, "rate converter created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning converted output (may be empty).
    ///
    /// Input is accumulated until a full `chunk_size` block is available;
    /// the remainder is kept for the next call. Passthrough copies.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Output frames of latency introduced by the resampler.
    pub fn output_delay(&self) -> usize {
        self.resampler.as_ref().map_or(0, |r| r.output_delay())
    }

    /// Returns `true` when both rates match (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert one complete buffer, compensating for resampler delay and
/// trimming to `len * to_rate / from_rate` frames.
///
/// # Errors
/// Returns the rubato construction error for unsupported ratios.
pub fn resample_whole(
    from_rate: u32,
    to_rate: u32,
    samples: &[f32],
) -> Result<Vec<f32>, ResamplerConstructionError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut converter = RateConverter::new(from_rate, to_rate, WHOLE_CHUNK)?;
    let expected =
        (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let delay = converter.output_delay();

    let mut out = converter.process(samples);
    let silence = vec![0f32; WHOLE_CHUNK];
    // Each flush call yields ~WHOLE_CHUNK * ratio frames; bounded for safety.
    for _ in 0..64 {
        if out.len() >= expected + delay {
            break;
        }
        out.extend(converter.process(&silence));
    }

    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    Ok(out)
}
