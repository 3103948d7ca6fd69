//! Speaker playback: a sample-accurate mixer driven by a cpal output stream.
//!
//! The mixer's frame counter *is* the playback clock. A chunk scheduled at
//! `start_at` seconds begins on frame `round(start_at * rate)`, so two chunks
//! whose start times abut play back with no gap and no overlap.

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

use crate::audio::port::ChunkId;
#[cfg(feature = "audio-cpal")]
use crate::{
    audio::port::{PlaybackEvent, PlaybackPort},
    audio::watchdog::{stream_fault, StallWatchdog},
    buffering::chunk::PlaybackChunk,
    error::{LiveVoxError, Result},
};

/// Playback settings for one session.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Preferred output rate (Hz). Default: 24000, the rate of model speech.
    pub sample_rate: u32,
    /// Preferred output device name; falls back to the default device.
    pub preferred_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            preferred_device: None,
        }
    }
}

#[derive(Debug)]
struct Voice {
    id: ChunkId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mono voice mixer with an absolute frame clock.
#[derive(Debug)]
pub struct Mixer {
    clock: u64,
    sample_rate: u32,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            clock: 0,
            sample_rate: sample_rate.max(1),
            voices: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Clock position in seconds.
    pub fn now_secs(&self) -> f64 {
        self.clock as f64 / self.sample_rate as f64
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Queue `samples` (at the mixer rate) to start at `start_at` seconds.
    /// A start time already in the past begins on the next rendered frame.
    ///
    /// Returns the effective start in seconds.
    pub fn add(&mut self, id: ChunkId, start_at: f64, samples: Vec<f32>) -> f64 {
        let requested = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        let start_frame = requested.max(self.clock);
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        start_frame as f64 / self.sample_rate as f64
    }

    /// Drop the listed voices immediately.
    pub fn stop(&mut self, ids: &[ChunkId]) {
        self.voices.retain(|v| !ids.contains(&v.id));
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Render `out.len() / channels` frames, duplicating mono into every
    /// channel. Voices that reach their end are removed and their ids pushed
    /// onto `finished`.
    pub fn render(&mut self, out: &mut [f32], channels: usize, finished: &mut Vec<ChunkId>) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let window_start = self.clock;
        let window_end = window_start + frames as u64;

        out.fill(0.0);
        for voice in &self.voices {
            let from = voice.start_frame.max(window_start);
            let to = voice.end_frame().min(window_end);
            if from >= to {
                continue;
            }
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let base = (frame - window_start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }
        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.clock = window_end;
        self.voices.retain(|v| {
            if v.end_frame() <= window_end {
                finished.push(v.id);
                false
            } else {
                true
            }
        });
    }
}

// ---------------------------------------------------------------------------
// cpal implementation
// ---------------------------------------------------------------------------

/// Speaker playback port over cpal.
#[cfg(feature = "audio-cpal")]
pub struct CpalPlayback {
    config: PlaybackConfig,
    mixer: Arc<Mutex<Mixer>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

#[cfg(feature = "audio-cpal")]
impl CpalPlayback {
    pub fn new(config: PlaybackConfig) -> Self {
        let mixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate)));
        Self {
            config,
            mixer,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl PlaybackPort for CpalPlayback {
    fn open(&mut self, events: mpsc::UnboundedSender<PlaybackEvent>) -> Result<u32> {
        if self.worker.is_some() {
            return Err(LiveVoxError::Playback("playback already open".into()));
        }

        self.running.store(true, Ordering::SeqCst);
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let mixer = Arc::clone(&self.mixer);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = std::thread::Builder::new()
            .name("livevox-playback".into())
            .spawn(move || playback_thread(config, running, mixer, events, open_tx))?;

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
                Err(LiveVoxError::Playback(
                    "playback thread died during open".into(),
                ))
            }
        }
    }

    fn now(&self) -> f64 {
        self.mixer.lock().now_secs()
    }

    fn schedule(&mut self, id: ChunkId, chunk: &PlaybackChunk, start_at: f64) -> Result<f64> {
        if self.worker.is_none() {
            return Err(LiveVoxError::Playback("playback not open".into()));
        }
        let device_rate = self.mixer.lock().sample_rate();
        let mono = chunk.to_mono();
        let samples = crate::audio::resample::resample_whole(chunk.sample_rate, device_rate, &mono)
            .map_err(|e| LiveVoxError::Playback(format!("resample: {e}")))?;
        Ok(self.mixer.lock().add(id, start_at, samples))
    }

    fn stop(&mut self, ids: &[ChunkId]) {
        self.mixer.lock().stop(ids);
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("playback thread panicked");
            }
            info!("speaker released");
        }
        self.mixer.lock().clear();
    }
}

#[cfg(feature = "audio-cpal")]
impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "audio-cpal")]
fn playback_thread(
    config: PlaybackConfig,
    running: Arc<AtomicBool>,
    mixer: Arc<Mutex<Mixer>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    open_tx: std::sync::mpsc::Sender<Result<u32>>,
) {
    use cpal::traits::StreamTrait;

    let device_fault: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let opened = open_output_stream(&config, Arc::clone(&mixer), events.clone(), Arc::clone(&device_fault))
        .and_then(|(stream, rate)| {
            stream
                .play()
                .map_err(|e| LiveVoxError::Playback(e.to_string()))?;
            Ok((stream, rate))
        });

    let stream = match opened {
        Ok((stream, rate)) => {
            let _ = open_tx.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = open_tx.send(Err(e));
            return;
        }
    };

    // The output callback renders continuously, so a frozen clock means a dead stream.
    let mut watchdog = StallWatchdog::default();
    watchdog.arm(Instant::now());
    let mut last_clock = mixer.lock().now_secs();

    while running.load(Ordering::Relaxed) {
        let clock = mixer.lock().now_secs();
        if clock != last_clock {
            last_clock = clock;
            watchdog.feed(Instant::now());
        }

        let fault = device_fault.lock().take().or_else(|| {
            watchdog
                .is_stalled(Instant::now())
                .then(|| "output device stopped rendering".to_string())
        });
        if let Some(fault) = fault {
            error!(%fault, "output device failed");
            let _ = events.send(PlaybackEvent::Failed(LiveVoxError::Playback(fault)));
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    drop(stream);
}

#[cfg(feature = "audio-cpal")]
fn open_output_stream(
    config: &PlaybackConfig,
    mixer: Arc<Mutex<Mixer>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    device_fault: Arc<Mutex<Option<String>>>,
) -> Result<(cpal::Stream, u32)> {
    use cpal::traits::DeviceTrait;
    use cpal::{SampleFormat, SampleRate};

    let host = cpal::default_host();
    let device = select_output_device(&host, config.preferred_device.as_deref())?;
    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let wanted = SampleRate(config.sample_rate);
    let supported = device
        .supported_output_configs()
        .ok()
        .and_then(|ranges| {
            let mut candidates: Vec<_> = ranges
                .filter(|r| r.min_sample_rate() <= wanted && r.max_sample_rate() >= wanted)
                .filter(|r| r.channels() <= 2)
                .collect();
            candidates.sort_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32));
            candidates.into_iter().next().map(|r| r.with_sample_rate(wanted))
        })
        .map_or_else(
            || {
                device
                    .default_output_config()
                    .map_err(|e| LiveVoxError::Playback(e.to_string()))
            },
            Ok,
        )?;

    let sample_rate = supported.sample_rate().0;
    info!(
        sample_rate,
        channels = supported.channels(),
        format = ?supported.sample_format(),
        "output config selected"
    );
    if sample_rate != config.sample_rate {
        debug!(
            from = config.sample_rate,
            to = sample_rate,
            "playback chunks will be resampled"
        );
    }

    // Re-seat the mixer clock at the device rate before the first callback.
    *mixer.lock() = Mixer::new(sample_rate);

    let stream_config = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_mixer_output::<f32>(&device, &stream_config, mixer, events, device_fault)
        }
        SampleFormat::I16 => {
            build_mixer_output::<i16>(&device, &stream_config, mixer, events, device_fault)
        }
        SampleFormat::U16 => {
            build_mixer_output::<u16>(&device, &stream_config, mixer, events, device_fault)
        }
        fmt => {
            return Err(LiveVoxError::Playback(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }?;

    Ok((stream, sample_rate))
}

#[cfg(feature = "audio-cpal")]
fn select_output_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(preferred_name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(found) =
                    devices.find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false))
                {
                    return Ok(found);
                }
                warn!("preferred output device '{}' not found, falling back", preferred_name);
            }
            Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
        }
    }

    host.default_output_device()
        .ok_or_else(|| LiveVoxError::Playback("no output device available".into()))
}

#[cfg(feature = "audio-cpal")]
fn build_mixer_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    device_fault: Arc<Mutex<Option<String>>>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    use cpal::traits::DeviceTrait;

    let channels = usize::from(config.channels.max(1));
    let mut scratch: Vec<f32> = Vec::new();
    let mut finished: Vec<ChunkId> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                mixer.lock().render(&mut scratch, channels, &mut finished);
                for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(src);
                }
                for id in finished.drain(..) {
                    let _ = events.send(PlaybackEvent::Finished(id));
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
                *device_fault.lock() = Some(stream_fault("output", &err));
            },
            None,
        )
        .map_err(|e| LiveVoxError::Playback(e.to_string()))
}
