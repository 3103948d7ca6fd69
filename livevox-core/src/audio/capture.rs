//! Microphone capture: cpal input stream → ring buffer → fixed-size blocks.
//!
//! ```text
//! cpal callback (RT thread)          capture thread
//! ─────────────────────────          ──────────────────────────────────────
//! mix to mono ─► push_slice ──ring──► pop_slice ─► RateConverter ─► BlockAssembler
//!                                                                     │
//!                                                   CaptureEvent::Block (level)
//! ```
//!
//! The callback is gated by a `streaming` flag so the device can be opened
//! (and permission obtained) while the channel is still connecting, without
//! emitting any audio until the session goes active.

#[cfg(feature = "audio-cpal")]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use std::thread::JoinHandle;
#[cfg(feature = "audio-cpal")]
use std::time::Instant;

#[cfg(feature = "audio-cpal")]
use parking_lot::Mutex;
#[cfg(feature = "audio-cpal")]
use tokio::sync::mpsc;
#[cfg(feature = "audio-cpal")]
use tracing::{debug, error, info, warn};

use crate::buffering::chunk::SampleBlock;
#[cfg(feature = "audio-cpal")]
use crate::{
    audio::port::{CaptureEvent, CapturePort},
    audio::watchdog::{stream_fault, StallWatchdog},
    error::{LiveVoxError, Result},
};

/// Gain applied to mean absolute amplitude for the visualizer.
pub const LEVEL_SCALE: f32 = 500.0;

/// Upper bound of the visualizer level.
pub const LEVEL_MAX: f32 = 100.0;

/// Capture settings for one session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate of emitted blocks (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Samples per emitted block. Default: 4096 (~0.256 s at 16 kHz).
    pub block_size: usize,
    /// Preferred input device name; falls back to the default device.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            block_size: 4096,
            preferred_device: None,
        }
    }
}

/// Visualizer level of a block: mean absolute amplitude × 500, clamped to [0, 100].
pub fn block_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s.abs()).sum();
    (sum / samples.len() as f32 * LEVEL_SCALE).clamp(0.0, LEVEL_MAX)
}

/// Cuts a continuous sample stream into blocks of exactly `block_size`.
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        Self {
            block_size: block_size.max(1),
            sample_rate,
            pending: Vec::with_capacity(block_size.max(1) * 2),
        }
    }

    /// Append samples and return every block that is now complete, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<SampleBlock> {
        self.pending.extend_from_slice(samples);
        let mut blocks = Vec::new();
        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            let full = std::mem::replace(&mut self.pending, rest);
            blocks.push(SampleBlock::mono(full, self.sample_rate));
        }
        blocks
    }

    /// Samples waiting for the next block.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// cpal implementation
// ---------------------------------------------------------------------------

/// Samples drained from the ring per pump iteration.
#[cfg(feature = "audio-cpal")]
const DRAIN_CHUNK: usize = 960;

/// Pump sleep when the ring is empty.
#[cfg(feature = "audio-cpal")]
const SLEEP_EMPTY_MS: u64 = 5;

/// Microphone capture port over cpal.
///
/// `CpalCapture` itself is `Send`: the `!Send` stream lives on the capture
/// thread and never leaves it.
#[cfg(feature = "audio-cpal")]
pub struct CpalCapture {
    config: CaptureConfig,
    /// Gate for the input callback; `false` until `start_streaming`.
    streaming: Arc<AtomicBool>,
    /// Keeps the capture thread alive.
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

#[cfg(feature = "audio-cpal")]
impl CpalCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            streaming: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl CapturePort for CpalCapture {
    fn open(&mut self, events: mpsc::Sender<CaptureEvent>) -> Result<u32> {
        if self.worker.is_some() {
            return Err(LiveVoxError::Device("capture already open".into()));
        }

        self.running.store(true, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);

        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let streaming = Arc::clone(&self.streaming);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = std::thread::Builder::new()
            .name("livevox-capture".into())
            .spawn(move || capture_thread(config, running, streaming, events, open_tx))?;

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                self.worker = Some(worker);
                Ok(rate)
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(LiveVoxError::Device("capture thread died during open".into()))
            }
        }
    }

    fn start_streaming(&mut self) {
        if !self.streaming.swap(true, Ordering::SeqCst) {
            info!("capture streaming started");
        }
    }

    fn close(&mut self) {
        self.streaming.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("capture thread panicked");
            }
            info!("microphone released");
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Body of the capture thread: open the device, then pump until stopped.
#[cfg(feature = "audio-cpal")]
fn capture_thread(
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    streaming: Arc<AtomicBool>,
    events: mpsc::Sender<CaptureEvent>,
    open_tx: std::sync::mpsc::Sender<Result<u32>>,
) {
    use crate::audio::resample::RateConverter;
    use crate::buffering::{create_audio_ring, Consumer};
    use cpal::traits::StreamTrait;

    let (producer, mut consumer) = create_audio_ring();
    let device_fault: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let opened = open_input_stream(&config, producer, Arc::clone(&streaming), Arc::clone(&device_fault))
        .and_then(|(stream, rate)| {
            stream
                .play()
                .map_err(|e| LiveVoxError::Device(e.to_string()))?;
            Ok((stream, rate))
        });

    let (stream, device_rate) = match opened {
        Ok(v) => v,
        Err(e) => {
            let _ = open_tx.send(Err(e));
            return;
        }
    };

    let mut converter = match RateConverter::new(device_rate, config.sample_rate, DRAIN_CHUNK) {
        Ok(c) => c,
        Err(e) => {
            let _ = open_tx.send(Err(LiveVoxError::Device(format!("resampler init: {e}"))));
            return;
        }
    };
    if !converter.is_passthrough() {
        info!(
            from = device_rate,
            to = config.sample_rate,
            "capture resampling enabled"
        );
    }

    let _ = open_tx.send(Ok(device_rate));

    let mut assembler = BlockAssembler::new(config.block_size, config.sample_rate);
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut watchdog = StallWatchdog::default();

    'pump: while running.load(Ordering::Relaxed) {
        let fault = device_fault.lock().take().or_else(|| {
            watchdog
                .is_stalled(Instant::now())
                .then(|| "input device stopped delivering audio".to_string())
        });
        if let Some(fault) = fault {
            error!(%fault, "input device failed");
            let _ = events.blocking_send(CaptureEvent::Failed(LiveVoxError::Device(fault)));
            break;
        }

        // Only a gated-open stream is expected to deliver samples.
        if streaming.load(Ordering::Relaxed) {
            watchdog.arm(Instant::now());
        }

        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(std::time::Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }
        watchdog.feed(Instant::now());

        let converted = converter.process(&raw[..n]);
        for block in assembler.push(&converted) {
            let level = block_level(&block.samples);
            debug!(samples = block.samples.len(), level, "capture block");
            if events
                .blocking_send(CaptureEvent::Block { block, level })
                .is_err()
            {
                debug!("capture receiver dropped, stopping pump");
                break 'pump;
            }
        }
    }

    // Stream drops here, releasing the microphone on this thread.
    drop(stream);
}

/// Resolve the input device and build a mono-mixing stream feeding `producer`.
#[cfg(feature = "audio-cpal")]
fn open_input_stream(
    config: &CaptureConfig,
    producer: crate::buffering::AudioProducer,
    streaming: Arc<AtomicBool>,
    device_fault: Arc<Mutex<Option<String>>>,
) -> Result<(cpal::Stream, u32)> {
    use cpal::traits::DeviceTrait;
    use cpal::{SampleFormat, SampleRate};

    let host = cpal::default_host();
    let device = select_input_device(&host, config.preferred_device.as_deref())?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let wanted = SampleRate(config.sample_rate);
    let supported = device
        .supported_input_configs()
        .ok()
        .and_then(|ranges| {
            let mut candidates: Vec<_> = ranges
                .filter(|r| r.min_sample_rate() <= wanted && r.max_sample_rate() >= wanted)
                .collect();
            candidates.sort_by_key(|r| (r.channels() != 1, r.sample_format() != SampleFormat::F32));
            candidates.into_iter().next().map(|r| r.with_sample_rate(wanted))
        })
        .map_or_else(
            || {
                device
                    .default_input_config()
                    .map_err(|e| LiveVoxError::Device(e.to_string()))
            },
            Ok,
        )?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    info!(sample_rate, channels, format = ?supported.sample_format(), "input config selected");

    let stream_config = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_mono_input::<f32>(
            &device, &stream_config, producer, streaming, device_fault, |s| s,
        ),
        SampleFormat::I16 => build_mono_input::<i16>(
            &device, &stream_config, producer, streaming, device_fault,
            |s| s as f32 / 32768.0,
        ),
        SampleFormat::U16 => build_mono_input::<u16>(
            &device, &stream_config, producer, streaming, device_fault,
            |s| (s as f32 - 32768.0) / 32768.0,
        ),
        SampleFormat::U8 => build_mono_input::<u8>(
            &device, &stream_config, producer, streaming, device_fault,
            |s| (s as f32 - 128.0) / 128.0,
        ),
        fmt => {
            return Err(LiveVoxError::Device(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }?;

    Ok((stream, sample_rate))
}

#[cfg(feature = "audio-cpal")]
fn select_input_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(preferred_name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(found) =
                    devices.find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false))
                {
                    return Ok(found);
                }
                warn!("preferred input device '{}' not found, falling back", preferred_name);
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }

    let mut devices = host
        .input_devices()
        .map_err(|e| LiveVoxError::Device(e.to_string()))?;
    let fallback = devices
        .next()
        .ok_or_else(|| LiveVoxError::Device("no input device available".into()))?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

/// Build an input stream that averages interleaved channels into mono.
#[cfg(feature = "audio-cpal")]
fn build_mono_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: crate::buffering::AudioProducer,
    streaming: Arc<AtomicBool>,
    device_fault: Arc<Mutex<Option<String>>>,
    to_f32: fn(T) -> f32,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + 'static,
{
    use crate::buffering::Producer;
    use cpal::traits::DeviceTrait;

    let ch = usize::from(config.channels.max(1));
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !streaming.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch].iter().map(|&s| to_f32(s)).sum();
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("ring buffer full: dropped {} frames", mix_buf.len() - written);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                *device_fault.lock() = Some(stream_fault("input", &err));
            },
            None,
        )
        .map_err(|e| LiveVoxError::Device(e.to_string()))
}
