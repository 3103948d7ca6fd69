//! PCM16 frame codec.
//!
//! ## Wire format
//!
//! ```text
//! f32 [-1, 1] ──×32768──► i16 (saturating) ──LE bytes──► base64 ──► TransportFrame
//! TransportFrame.data ──base64──► LE bytes ──► i16 ──÷32768──► f32, de-interleaved
//! ```
//!
//! Both directions are pure and allocation-bounded by the input size.
//!
//! Encoding saturates: samples outside [-1, 1) clamp to `i16::MIN`/`i16::MAX`
//! (Rust's float→int `as` conversion saturates and maps NaN to 0). Wrapping
//! would turn a slightly clipped peak into a full-scale click.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::buffering::chunk::{PlaybackChunk, SampleBlock};
use crate::error::{LiveVoxError, Result};

/// PCM16 full-scale factor shared by both directions.
pub const PCM16_SCALE: f32 = 32768.0;

/// MIME descriptor for outbound microphone frames.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// One encoded block, ready for the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportFrame {
    /// base64 (standard alphabet, padded) of PCM16 little-endian samples.
    pub data: String,
    /// e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
}

/// Encode a captured block into a transport frame.
pub fn encode_block(block: &SampleBlock) -> TransportFrame {
    let mut bytes = Vec::with_capacity(block.samples.len() * 2);
    for &sample in &block.samples {
        bytes.extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
    }
    TransportFrame {
        data: BASE64.encode(&bytes),
        mime_type: pcm_mime_type(block.sample_rate),
    }
}

/// Decode a base64 PCM16 payload into a playable chunk.
///
/// # Errors
/// `LiveVoxError::TransportDecode` if the payload is not valid base64, has an
/// odd byte length, or its sample count is not a multiple of `channels`.
pub fn decode_frame(data: &str, sample_rate: u32, channels: u16) -> Result<PlaybackChunk> {
    if channels == 0 {
        return Err(LiveVoxError::TransportDecode("channel count is zero".into()));
    }

    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| LiveVoxError::TransportDecode(format!("invalid base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(LiveVoxError::TransportDecode(format!(
            "truncated PCM16 payload: {} bytes",
            bytes.len()
        )));
    }

    let sample_count = bytes.len() / 2;
    let ch = usize::from(channels);
    if sample_count % ch != 0 {
        return Err(LiveVoxError::TransportDecode(format!(
            "{sample_count} samples do not divide into {channels} channels"
        )));
    }

    let frame_count = sample_count / ch;
    let mut out = vec![Vec::with_capacity(frame_count); ch];
    for (idx, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[idx % ch].push(pcm16_to_sample(sample));
    }

    Ok(PlaybackChunk {
        channels: out,
        sample_rate,
    })
}

#[inline]
fn sample_to_pcm16(sample: f32) -> i16 {
    (sample * PCM16_SCALE) as i16
}

#[inline]
fn pcm16_to_sample(sample: i16) -> f32 {
    f32::from(sample) / PCM16_SCALE
}
