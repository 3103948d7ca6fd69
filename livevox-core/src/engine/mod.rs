//! `VoiceEngine` — top-level handle that starts and stops voice sessions.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceEngine::new(config, backend, connector)
//!     └─► start_session(persona)  → controller spawned, state = Connecting
//!         │                          channel open → Active
//!         └─► stop_session().await → Ending → teardown → Closed
//! ```
//!
//! Only one session runs at a time. `start_session` fails with
//! `AlreadyRunning` until the previous session has reached `Closed`;
//! `stop_session` fails with `NotRunning` when there is nothing to stop.
//!
//! ## Threading
//!
//! The controller is a tokio task; blocking device opens and closes are
//! pushed to the blocking pool, and the `!Send` cpal streams live on their
//! own threads inside the ports. `start_session` must therefore be called
//! from within a tokio runtime.

pub mod session;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    audio::{AudioBackend, CaptureConfig, CpalBackend, PlaybackConfig},
    error::{LiveVoxError, Result},
    ipc::events::{LevelEvent, SessionErrorEvent, SessionState, SessionStateEvent},
    transport::{Connector, DEFAULT_CLOSE_TIMEOUT},
};

pub use session::{DiagnosticsSnapshot, SessionDiagnostics};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration applied to every session started by a `VoiceEngine`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rate of outbound microphone frames (Hz). Default: 16000.
    pub input_sample_rate: u32,
    /// Rate of inbound model speech (Hz) when the message does not say. Default: 24000.
    pub output_sample_rate: u32,
    /// Samples per captured block. Default: 4096.
    pub block_size: usize,
    /// Channels in inbound audio. Always 1 for the live model.
    pub output_channels: u16,
    /// Preferred microphone name. `None` uses the system default.
    pub input_device: Option<String>,
    /// Preferred speaker name. `None` uses the system default.
    pub output_device: Option<String>,
    /// Upper bound on waiting for the transport to shut down.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            block_size: 4096,
            output_channels: 1,
            input_device: None,
            output_device: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            block_size: self.block_size,
            preferred_device: self.input_device.clone(),
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.output_sample_rate,
            preferred_device: self.output_device.clone(),
        }
    }

    /// Native cpal backend honouring this configuration's devices and rates.
    pub fn cpal_backend(&self) -> CpalBackend {
        CpalBackend::new(self.capture_config(), self.playback_config())
    }
}

struct RunningSession {
    id: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// The top-level engine handle.
///
/// `VoiceEngine` is `Send + Sync`; wrap it in `Arc` to share it between the
/// host's command handlers and event-forwarding tasks.
pub struct VoiceEngine {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    /// State of the current (or last) session.
    state: Arc<Mutex<SessionState>>,
    /// Held across the stop await so a new session cannot start mid-teardown.
    running: tokio::sync::Mutex<Option<RunningSession>>,
    state_tx: broadcast::Sender<SessionStateEvent>,
    level_tx: broadcast::Sender<LevelEvent>,
    error_tx: broadcast::Sender<SessionErrorEvent>,
    next_session_id: AtomicU64,
    diagnostics: Arc<SessionDiagnostics>,
}

impl VoiceEngine {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (error_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            backend,
            connector,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            running: tokio::sync::Mutex::new(None),
            state_tx,
            level_tx,
            error_tx,
            next_session_id: AtomicU64::new(1),
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    /// Start a new session with an optional system instruction (persona).
    ///
    /// Returns immediately with the session id; progress is reported on the
    /// state stream.
    ///
    /// # Errors
    /// - `LiveVoxError::AlreadyRunning` if a session has not yet reached
    ///   `Closed`, or is being stopped right now.
    pub fn start_session(&self, system_instruction: Option<String>) -> Result<u64> {
        let mut running = self
            .running
            .try_lock()
            .map_err(|_| LiveVoxError::AlreadyRunning)?;

        if let Some(previous) = running.as_ref() {
            let closed = previous.task.is_finished() || self.state() == SessionState::Closed;
            if !closed {
                return Err(LiveVoxError::AlreadyRunning);
            }
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.diagnostics.reset();
        *self.state.lock() = SessionState::Idle;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(session::run(session::SessionContext {
            session_id,
            config: self.config.clone(),
            system_instruction,
            backend: Arc::clone(&self.backend),
            connector: Arc::clone(&self.connector),
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
            level_tx: self.level_tx.clone(),
            error_tx: self.error_tx.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            stop_rx,
        }));

        *running = Some(RunningSession {
            id: session_id,
            stop_tx: Some(stop_tx),
            task,
        });
        info!(session_id, "voice session started");
        Ok(session_id)
    }

    /// Stop the current session and wait until it has reached `Closed`.
    ///
    /// Safe to call in any session state, including mid-connect.
    ///
    /// # Errors
    /// - `LiveVoxError::NotRunning` if no session is live.
    pub async fn stop_session(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(session) = running.as_mut() else {
            return Err(LiveVoxError::NotRunning);
        };
        if session.task.is_finished() || self.state() == SessionState::Closed {
            let _ = (&mut session.task).await;
            *running = None;
            return Err(LiveVoxError::NotRunning);
        }

        info!(session_id = session.id, "voice session stop requested");
        if let Some(stop_tx) = session.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let joined = (&mut session.task).await;
        *running = None;
        joined.map_err(|e| LiveVoxError::Other(anyhow::anyhow!("session task failed: {e}")))
    }

    /// State of the current (or most recent) session.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionStateEvent> {
        self.state_tx.subscribe()
    }

    /// Subscribe to per-block microphone levels.
    pub fn subscribe_level(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }

    /// Subscribe to terminal session errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<SessionErrorEvent> {
        self.error_tx.subscribe()
    }

    /// Snapshot of the current session's counters.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}
