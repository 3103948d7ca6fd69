//! The per-session controller task.
//!
//! One controller owns the capture port, the playback scheduler and the
//! duplex channel for exactly one session, and is the only place that knows
//! about both audio directions:
//!
//! ```text
//! capture events ─► encode_block ─► channel.send          (outbound)
//! channel events ─► decode_frame ─► scheduler.schedule    (inbound)
//! playback events ─► scheduler.complete
//! stop command   ─► Ending ─► teardown ─► Closed
//! ```
//!
//! All four sources are multiplexed with `tokio::select!` on a single task,
//! so no handler ever runs concurrently with another.

use std::ops::ControlFlow;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::SessionConfig;
use crate::{
    audio::port::{AudioBackend, CaptureEvent, CapturePort, PlaybackEvent},
    buffering::chunk::SampleBlock,
    codec::{decode_frame, encode_block},
    error::LiveVoxError,
    ipc::events::{LevelEvent, SessionErrorEvent, SessionState, SessionStateEvent},
    playback::PlaybackScheduler,
    transport::{ChannelEvent, Connector, DuplexChannel, ServerMessage, SessionSetup},
};

/// Capture blocks buffered between the capture thread and the controller.
/// At 4096 samples / 16 kHz this is ~8 s of audio.
const CAPTURE_QUEUE: usize = 32;

/// Session counters, shared with the engine for observability.
pub struct SessionDiagnostics {
    pub blocks_captured: AtomicUsize,
    pub blocks_discarded: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub messages_received: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub chunks_completed: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub interruptions: AtomicUsize,
}

impl Default for SessionDiagnostics {
    fn default() -> Self {
        Self {
            blocks_captured: AtomicUsize::new(0),
            blocks_discarded: AtomicUsize::new(0),
            frames_sent: AtomicUsize::new(0),
            messages_received: AtomicUsize::new(0),
            chunks_scheduled: AtomicUsize::new(0),
            chunks_completed: AtomicUsize::new(0),
            decode_errors: AtomicUsize::new(0),
            interruptions: AtomicUsize::new(0),
        }
    }
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.blocks_captured.store(0, Ordering::Relaxed);
        self.blocks_discarded.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.chunks_completed.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_captured: self.blocks_captured.load(Ordering::Relaxed),
            blocks_discarded: self.blocks_discarded.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub blocks_captured: usize,
    pub blocks_discarded: usize,
    pub frames_sent: usize,
    pub messages_received: usize,
    pub chunks_scheduled: usize,
    pub chunks_completed: usize,
    pub decode_errors: usize,
    pub interruptions: usize,
}

/// Everything the controller needs, passed as one struct so the spawn stays tidy.
pub struct SessionContext {
    pub session_id: u64,
    pub config: SessionConfig,
    pub system_instruction: Option<String>,
    pub backend: Arc<dyn AudioBackend>,
    pub connector: Arc<dyn Connector>,
    pub state: Arc<Mutex<SessionState>>,
    pub state_tx: broadcast::Sender<SessionStateEvent>,
    pub level_tx: broadcast::Sender<LevelEvent>,
    pub error_tx: broadcast::Sender<SessionErrorEvent>,
    pub diagnostics: Arc<SessionDiagnostics>,
    pub stop_rx: oneshot::Receiver<()>,
}

/// How the event loop ended.
enum Outcome {
    Stopped,
    Failed(LiveVoxError),
}

/// Drive one session from `Connecting` to `Closed`.
pub async fn run(ctx: SessionContext) {
    let SessionContext {
        session_id,
        config,
        system_instruction,
        backend,
        connector,
        state,
        state_tx,
        level_tx,
        error_tx,
        diagnostics,
        mut stop_rx,
    } = ctx;

    let mut session = Session {
        id: session_id,
        config,
        state,
        state_tx,
        level_tx,
        diagnostics,
        capture: None,
        scheduler: None,
        level_seq: 0,
    };

    session.transition(SessionState::Connecting, None);
    info!(session_id, "voice session connecting");

    let mut channel = connector.open(SessionSetup {
        session_id,
        system_instruction,
    });
    channel.set_close_timeout(session.config.close_timeout);

    let (capture_tx, mut capture_rx) = mpsc::channel::<CaptureEvent>(CAPTURE_QUEUE);
    let (playback_tx, mut playback_rx) = mpsc::unbounded_channel::<PlaybackEvent>();

    // A stop during a slow open (e.g. a permission prompt) abandons the open;
    // the blocking task drops and thereby releases its port when it returns.
    let opened = tokio::select! {
        res = session.open_devices(backend.as_ref(), capture_tx, playback_tx) => Some(res),
        _ = &mut stop_rx => None,
    };

    let outcome = match opened {
        None => {
            info!(session_id, "stop requested while opening devices");
            Outcome::Stopped
        }
        Some(Err(e)) => Outcome::Failed(e),
        Some(Ok(())) => loop {
            let flow = tokio::select! {
                _ = &mut stop_rx => ControlFlow::Break(Outcome::Stopped),
                event = channel.recv() => session.on_channel_event(event),
                Some(event) = capture_rx.recv() => session.on_capture_event(event, &channel),
                Some(event) = playback_rx.recv() => session.on_playback_event(event),
            };
            if let ControlFlow::Break(outcome) = flow {
                break outcome;
            }
        },
    };

    match outcome {
        Outcome::Stopped => {
            session.transition(SessionState::Ending, None);
            // Unblock a capture thread waiting on a full queue before joining it.
            capture_rx.close();
            playback_rx.close();
            session.teardown(&mut channel).await;
            info!(session_id, "voice session ended");
        }
        Outcome::Failed(err) => {
            error!(session_id, error = %err, "voice session failed");
            session.transition(SessionState::Error, Some(err.to_string()));
            capture_rx.close();
            playback_rx.close();
            session.teardown(&mut channel).await;
            let _ = error_tx.send(SessionErrorEvent::from_error(session_id, &err));
        }
    }

    session.transition(SessionState::Closed, None);
}

struct Session {
    id: u64,
    config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
    state_tx: broadcast::Sender<SessionStateEvent>,
    level_tx: broadcast::Sender<LevelEvent>,
    diagnostics: Arc<SessionDiagnostics>,
    capture: Option<Box<dyn CapturePort>>,
    scheduler: Option<PlaybackScheduler>,
    level_seq: u64,
}

impl Session {
    fn current(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, next: SessionState, detail: Option<String>) {
        {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                warn!(
                    session_id = self.id,
                    from = ?*state,
                    to = ?next,
                    "illegal state transition ignored"
                );
                return;
            }
            *state = next;
        }
        debug!(session_id = self.id, state = ?next, "session state changed");
        let _ = self.state_tx.send(SessionStateEvent {
            session_id: self.id,
            state: next,
            detail,
        });
    }

    /// Open microphone and speaker in parallel on the blocking pool. Ports
    /// are kept even when their open fails so teardown can release them.
    async fn open_devices(
        &mut self,
        backend: &dyn AudioBackend,
        capture_tx: mpsc::Sender<CaptureEvent>,
        playback_tx: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<(), LiveVoxError> {
        let mut capture = backend.capture();
        let mut playback = backend.playback();

        let capture_open = tokio::task::spawn_blocking(move || {
            let result = capture.open(capture_tx);
            (capture, result)
        });
        let playback_open = tokio::task::spawn_blocking(move || {
            let result = playback.open(playback_tx);
            (playback, result)
        });
        let (capture_res, playback_res) = tokio::join!(capture_open, playback_open);

        let capture_err = match capture_res {
            Ok((port, result)) => {
                self.capture = Some(port);
                match result {
                    Ok(rate) => {
                        info!(session_id = self.id, device_rate = rate, "microphone opened");
                        None
                    }
                    Err(e) => Some(e),
                }
            }
            Err(e) => Some(LiveVoxError::Device(format!("capture open task failed: {e}"))),
        };

        let playback_err = match playback_res {
            Ok((port, result)) => {
                self.scheduler = Some(PlaybackScheduler::new(port));
                match result {
                    Ok(rate) => {
                        info!(session_id = self.id, device_rate = rate, "speaker opened");
                        None
                    }
                    Err(e) => Some(e),
                }
            }
            Err(e) => Some(LiveVoxError::Playback(format!(
                "playback open task failed: {e}"
            ))),
        };

        match capture_err.or(playback_err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_channel_event(&mut self, event: Option<ChannelEvent>) -> ControlFlow<Outcome> {
        match event {
            Some(ChannelEvent::Open) => {
                if self.current() == SessionState::Connecting {
                    self.transition(SessionState::Active, None);
                    if let Some(capture) = self.capture.as_mut() {
                        capture.start_streaming();
                    }
                    info!(session_id = self.id, "voice session active");
                }
                ControlFlow::Continue(())
            }
            Some(ChannelEvent::Message(msg)) => self.on_server_message(msg),
            Some(ChannelEvent::Closed { reason }) => {
                let reason = reason.unwrap_or_else(|| "no reason given".into());
                ControlFlow::Break(Outcome::Failed(LiveVoxError::Connection(format!(
                    "remote closed the session: {reason}"
                ))))
            }
            Some(ChannelEvent::Error(message)) => {
                ControlFlow::Break(Outcome::Failed(LiveVoxError::Connection(message)))
            }
            None => ControlFlow::Break(Outcome::Failed(LiveVoxError::Connection(
                "transport ended unexpectedly".into(),
            ))),
        }
    }

    fn on_server_message(&mut self, msg: ServerMessage) -> ControlFlow<Outcome> {
        self.diagnostics
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        if let Some(err) = &msg.error {
            return ControlFlow::Break(Outcome::Failed(LiveVoxError::Connection(format!(
                "server error: {}",
                err.message
            ))));
        }

        if self.current() != SessionState::Active {
            debug!(session_id = self.id, "message before session active ignored");
            return ControlFlow::Continue(());
        }

        if let Some(audio) = msg.audio() {
            let rate = audio
                .sample_rate()
                .unwrap_or(self.config.output_sample_rate);
            match decode_frame(&audio.data, rate, self.config.output_channels) {
                Ok(chunk) => {
                    if let Some(scheduler) = self.scheduler.as_mut() {
                        match scheduler.schedule(&chunk) {
                            Ok(Some(_)) => {
                                self.diagnostics
                                    .chunks_scheduled
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(None) => {}
                            Err(e) => return ControlFlow::Break(Outcome::Failed(e)),
                        }
                    }
                }
                Err(e) => {
                    self.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(session_id = self.id, error = %e, "dropping undecodable audio frame");
                }
            }
        }

        if msg.is_interrupted() {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.stop_all();
            }
            self.diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
            info!(session_id = self.id, "model interrupted; playback cleared");
        }

        if msg.is_turn_complete() {
            debug!(session_id = self.id, "model turn complete");
        }

        ControlFlow::Continue(())
    }

    fn on_capture_event(
        &mut self,
        event: CaptureEvent,
        channel: &DuplexChannel,
    ) -> ControlFlow<Outcome> {
        match event {
            CaptureEvent::Block { block, level } => {
                self.forward_block(&block, level, channel);
                ControlFlow::Continue(())
            }
            CaptureEvent::Failed(e) => ControlFlow::Break(Outcome::Failed(e)),
        }
    }

    fn forward_block(&mut self, block: &SampleBlock, level: f32, channel: &DuplexChannel) {
        self.diagnostics.blocks_captured.fetch_add(1, Ordering::Relaxed);
        if self.current() != SessionState::Active {
            self.diagnostics.blocks_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.level_seq += 1;
        let _ = self.level_tx.send(LevelEvent {
            seq: self.level_seq,
            level,
        });

        if channel.send(encode_block(block)) {
            self.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(session_id = self.id, "frame dropped: transport gone");
        }
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) -> ControlFlow<Outcome> {
        match event {
            PlaybackEvent::Finished(id) => {
                let completed = self
                    .scheduler
                    .as_mut()
                    .is_some_and(|scheduler| scheduler.complete(id));
                if completed {
                    self.diagnostics
                        .chunks_completed
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(session_id = self.id, chunk_id = id, "completion for inactive chunk ignored");
                }
                ControlFlow::Continue(())
            }
            PlaybackEvent::Failed(e) => ControlFlow::Break(Outcome::Failed(e)),
        }
    }

    /// Release every resource in order: microphone, playback, channel.
    /// Each step is idempotent.
    async fn teardown(&mut self, channel: &mut DuplexChannel) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || capture.close()).await {
                warn!(session_id = self.id, "capture close task failed: {e}");
            }
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || scheduler.close()).await {
                warn!(session_id = self.id, "playback close task failed: {e}");
            }
        }
        channel.close().await;
        debug!(session_id = self.id, "session resources released");
    }
}
