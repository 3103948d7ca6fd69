use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use livevox_core::audio::{
    block_level, AudioBackend, CaptureEvent, CapturePort, ChunkId, PlaybackEvent, PlaybackPort,
};
use livevox_core::buffering::chunk::{PlaybackChunk, SampleBlock};
use livevox_core::transport::{ChannelEvent, ChannelPeer, Outbound, ServerMessage, SessionSetup};
use livevox_core::{
    encode_block, Connector, DuplexChannel, ErrorKind, LiveVoxError, SessionConfig, SessionState,
    SessionStateEvent, VoiceEngine,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Scripted capture
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureControl {
    events: Mutex<Option<mpsc::Sender<CaptureEvent>>>,
    streaming: AtomicBool,
    closes: AtomicUsize,
    /// While set, `open` blocks as if waiting on a permission prompt.
    hold_open: AtomicBool,
}

impl CaptureControl {
    fn is_open(&self) -> bool {
        self.events.lock().is_some()
    }

    /// Deliver a block regardless of the streaming gate.
    fn push(&self, block: SampleBlock) {
        if let Some(tx) = self.events.lock().as_ref() {
            let level = block_level(&block.samples);
            tx.try_send(CaptureEvent::Block { block, level }).unwrap();
        }
    }

    fn fail(&self, message: &str) {
        if let Some(tx) = self.events.lock().as_ref() {
            tx.try_send(CaptureEvent::Failed(LiveVoxError::Device(message.into())))
                .unwrap();
        }
    }
}

struct ScriptedCapture {
    blocks: Vec<SampleBlock>,
    deny_open: bool,
    control: Arc<CaptureControl>,
}

impl CapturePort for ScriptedCapture {
    fn open(&mut self, events: mpsc::Sender<CaptureEvent>) -> livevox_core::Result<u32> {
        while self.control.hold_open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        if self.deny_open {
            return Err(LiveVoxError::Device("microphone permission denied".into()));
        }
        *self.control.events.lock() = Some(events);
        Ok(16_000)
    }

    fn start_streaming(&mut self) {
        self.control.streaming.store(true, Ordering::SeqCst);
        if let Some(tx) = self.control.events.lock().as_ref() {
            for block in self.blocks.drain(..) {
                let level = block_level(&block.samples);
                tx.try_send(CaptureEvent::Block { block, level }).unwrap();
            }
        }
    }

    fn close(&mut self) {
        self.control.closes.fetch_add(1, Ordering::SeqCst);
        self.control.events.lock().take();
    }
}

// ---------------------------------------------------------------------------
// Manual-clock playback
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PlaybackControl {
    now: Mutex<f64>,
    scheduled: Mutex<Vec<(ChunkId, f64, usize)>>,
    stops: Mutex<Vec<Vec<ChunkId>>>,
    events: Mutex<Option<mpsc::UnboundedSender<PlaybackEvent>>>,
    closes: AtomicUsize,
}

impl PlaybackControl {
    fn scheduled(&self) -> Vec<(ChunkId, f64, usize)> {
        self.scheduled.lock().clone()
    }

    fn finish(&self, id: ChunkId) {
        if let Some(tx) = self.events.lock().as_ref() {
            tx.send(PlaybackEvent::Finished(id)).unwrap();
        }
    }
}

struct ManualPlayback {
    control: Arc<PlaybackControl>,
}

impl PlaybackPort for ManualPlayback {
    fn open(&mut self, events: mpsc::UnboundedSender<PlaybackEvent>) -> livevox_core::Result<u32> {
        *self.control.events.lock() = Some(events);
        Ok(24_000)
    }

    fn now(&self) -> f64 {
        *self.control.now.lock()
    }

    fn schedule(
        &mut self,
        id: ChunkId,
        chunk: &PlaybackChunk,
        start_at: f64,
    ) -> livevox_core::Result<f64> {
        self.control
            .scheduled
            .lock()
            .push((id, start_at, chunk.frame_count()));
        Ok(start_at)
    }

    fn stop(&mut self, ids: &[ChunkId]) {
        self.control.stops.lock().push(ids.to_vec());
    }

    fn close(&mut self) {
        self.control.closes.fetch_add(1, Ordering::SeqCst);
        self.control.events.lock().take();
    }
}

struct ScriptedBackend {
    blocks: Vec<SampleBlock>,
    deny_open: bool,
    capture: Arc<CaptureControl>,
    playback: Arc<PlaybackControl>,
}

impl AudioBackend for ScriptedBackend {
    fn capture(&self) -> Box<dyn CapturePort> {
        Box::new(ScriptedCapture {
            blocks: self.blocks.clone(),
            deny_open: self.deny_open,
            control: Arc::clone(&self.capture),
        })
    }

    fn playback(&self) -> Box<dyn PlaybackPort> {
        Box::new(ManualPlayback {
            control: Arc::clone(&self.playback),
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted connector: hands the transport half to the test
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedConnector {
    peer: Mutex<Option<ChannelPeer>>,
    setups: Mutex<Vec<SessionSetup>>,
}

impl Connector for ScriptedConnector {
    fn open(&self, setup: SessionSetup) -> DuplexChannel {
        let (channel, peer) = DuplexChannel::pair();
        self.setups.lock().push(setup);
        *self.peer.lock() = Some(peer);
        channel
    }
}

impl ScriptedConnector {
    async fn take_peer(&self) -> ChannelPeer {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(peer) = self.peer.lock().take() {
                    return peer;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("connector was never opened")
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    engine: VoiceEngine,
    capture: Arc<CaptureControl>,
    playback: Arc<PlaybackControl>,
    connector: Arc<ScriptedConnector>,
    states: broadcast::Receiver<SessionStateEvent>,
}

fn harness(blocks: Vec<SampleBlock>, deny_open: bool) -> Harness {
    let capture = Arc::new(CaptureControl::default());
    let playback = Arc::new(PlaybackControl::default());
    let connector = Arc::new(ScriptedConnector::default());
    let backend = Arc::new(ScriptedBackend {
        blocks,
        deny_open,
        capture: Arc::clone(&capture),
        playback: Arc::clone(&playback),
    });
    let config = SessionConfig {
        close_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    };
    let engine = VoiceEngine::new(config, backend, Arc::clone(&connector) as Arc<dyn Connector>);
    let states = engine.subscribe_state();
    Harness {
        engine,
        capture,
        playback,
        connector,
        states,
    }
}

/// Collect state transitions until `target` is seen.
async fn states_until(
    rx: &mut broadcast::Receiver<SessionStateEvent>,
    target: SessionState,
) -> Vec<SessionState> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    seen.push(ev.state);
                    if ev.state == target {
                        return seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("state stream closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {target:?}"))
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn next_frame(peer: &mut ChannelPeer) -> livevox_core::TransportFrame {
    match tokio::time::timeout(WAIT, peer.next_outbound()).await {
        Ok(Some(Outbound::Frame(frame))) => frame,
        other => panic!("expected an outbound frame, got {other:?}"),
    }
}

fn block(value: f32) -> SampleBlock {
    SampleBlock::mono(vec![value; 4096], 16_000)
}

fn audio_message(secs: f64) -> ServerMessage {
    let frames = (secs * 24_000.0).round() as usize;
    let data = encode_block(&SampleBlock::mono(vec![0.1; frames], 24_000)).data;
    message(json!({
        "serverContent": {"modelTurn": {"parts": [{"inlineData": {
            "mimeType": "audio/pcm;rate=24000",
            "data": data,
        }}]}}
    }))
}

fn audio_json(secs: f64) -> serde_json::Value {
    let frames = (secs * 24_000.0).round() as usize;
    let data = encode_block(&SampleBlock::mono(vec![0.1; frames], 24_000)).data;
    json!({"modelTurn": {"parts": [{"inlineData": {
        "mimeType": "audio/pcm;rate=24000",
        "data": data,
    }}]}})
}

fn message(value: serde_json::Value) -> ServerMessage {
    ServerMessage::parse(&serde_json::to_vec(&value).unwrap()).unwrap()
}

/// Start a session and bring it to `Active`.
async fn activate(h: &mut Harness) -> ChannelPeer {
    h.engine.start_session(Some("Coach the athlete.".into())).unwrap();
    let peer = h.connector.take_peer().await;
    assert!(peer.emit(ChannelEvent::Open));
    let seen = states_until(&mut h.states, SessionState::Active).await;
    assert_eq!(seen, vec![SessionState::Connecting, SessionState::Active]);
    peer
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_capture_blocks_become_three_ordered_frames() {
    let blocks = vec![block(0.1), block(-0.2), block(0.3)];
    let mut h = harness(blocks.clone(), false);
    let mut levels = h.engine.subscribe_level();

    let mut peer = activate(&mut h).await;

    for expected in &blocks {
        assert_eq!(next_frame(&mut peer).await, encode_block(expected));
    }

    for (i, expected) in blocks.iter().enumerate() {
        let ev = levels.recv().await.unwrap();
        assert_eq!(ev.seq, i as u64 + 1);
        assert!((ev.level - block_level(&expected.samples)).abs() < 1e-4);
    }

    h.engine.stop_session().await.unwrap();
    let seen = states_until(&mut h.states, SessionState::Closed).await;
    assert_eq!(seen, vec![SessionState::Ending, SessionState::Closed]);

    let diag = h.engine.diagnostics_snapshot();
    assert_eq!(diag.frames_sent, 3);
    assert_eq!(diag.blocks_discarded, 0);
    assert_eq!(
        h.connector.setups.lock()[0].system_instruction.as_deref(),
        Some("Coach the athlete.")
    );
}

#[tokio::test]
async fn denied_microphone_goes_to_error_without_activating() {
    let mut h = harness(vec![block(0.1)], true);
    let mut errors = h.engine.subscribe_errors();

    h.engine.start_session(None).unwrap();
    let peer = h.connector.take_peer().await;
    // Even if the channel opens, the session must never become active.
    peer.emit(ChannelEvent::Open);

    let seen = states_until(&mut h.states, SessionState::Closed).await;
    assert_eq!(
        seen,
        vec![SessionState::Connecting, SessionState::Error, SessionState::Closed]
    );

    let err = errors.recv().await.unwrap();
    assert_eq!(err.kind, ErrorKind::Device);
    assert!(err.message.contains("permission denied"));

    assert!(!h.capture.streaming.load(Ordering::SeqCst));
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.playback.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.state(), SessionState::Closed);
}

#[tokio::test]
async fn inbound_audio_is_gapless_and_interruption_clears_playback() {
    let mut h = harness(Vec::new(), false);
    let peer = activate(&mut h).await;

    peer.emit(ChannelEvent::Message(audio_message(1.0)));
    peer.emit(ChannelEvent::Message(audio_message(0.6)));

    let playback = Arc::clone(&h.playback);
    eventually("two chunks scheduled", || playback.scheduled().len() == 2).await;

    let scheduled = h.playback.scheduled();
    let (first_id, first_start, first_frames) = scheduled[0];
    let (second_id, second_start, second_frames) = scheduled[1];
    assert_eq!(first_frames, 24_000);
    assert_eq!(second_frames, 14_400);
    assert!((second_start - (first_start + 1.0)).abs() < 1e-9);
    assert!((second_start + 0.6 - (first_start + 1.6)).abs() < 1e-9);

    peer.emit(ChannelEvent::Message(message(json!({
        "serverContent": {"interrupted": true}
    }))));
    eventually("interruption", || !playback.stops.lock().is_empty()).await;
    assert_eq!(*h.playback.stops.lock(), vec![vec![first_id, second_id]]);

    // Next chunk schedules relative to "now" again.
    *h.playback.now.lock() = 5.0;
    peer.emit(ChannelEvent::Message(audio_message(0.2)));
    eventually("post-interrupt chunk", || playback.scheduled().len() == 3).await;
    assert_eq!(h.playback.scheduled()[2].1, 5.0);

    assert_eq!(h.engine.state(), SessionState::Active);
    assert_eq!(h.engine.diagnostics_snapshot().interruptions, 1);

    h.engine.stop_session().await.unwrap();
}

#[tokio::test]
async fn playback_completion_is_counted() {
    let mut h = harness(Vec::new(), false);
    let peer = activate(&mut h).await;

    peer.emit(ChannelEvent::Message(audio_message(0.1)));
    let playback = Arc::clone(&h.playback);
    eventually("chunk scheduled", || playback.scheduled().len() == 1).await;

    h.playback.finish(h.playback.scheduled()[0].0);
    let engine = &h.engine;
    eventually("completion", || engine.diagnostics_snapshot().chunks_completed == 1).await;

    h.engine.stop_session().await.unwrap();
}

#[tokio::test]
async fn undecodable_frame_is_dropped_and_session_continues() {
    let mut h = harness(Vec::new(), false);
    let peer = activate(&mut h).await;

    peer.emit(ChannelEvent::Message(message(json!({
        "serverContent": {"modelTurn": {"parts": [{"inlineData": {"data": "AAE"}}]}}
    }))));
    peer.emit(ChannelEvent::Message(audio_message(0.25)));

    let playback = Arc::clone(&h.playback);
    eventually("valid chunk scheduled", || playback.scheduled().len() == 1).await;
    assert_eq!(h.engine.diagnostics_snapshot().decode_errors, 1);
    assert_eq!(h.engine.state(), SessionState::Active);

    h.engine.stop_session().await.unwrap();
}

#[tokio::test]
async fn stop_while_connecting_releases_everything() {
    let mut h = harness(vec![block(0.5)], false);
    h.engine.start_session(None).unwrap();
    let mut peer = h.connector.take_peer().await;

    h.engine.stop_session().await.unwrap();
    let seen = states_until(&mut h.states, SessionState::Closed).await;
    assert_eq!(
        seen,
        vec![SessionState::Connecting, SessionState::Ending, SessionState::Closed]
    );

    assert!(matches!(peer.next_outbound().await, Some(Outbound::Close)));
    assert!(!h.capture.streaming.load(Ordering::SeqCst));
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.playback.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.diagnostics_snapshot().frames_sent, 0);
}

#[tokio::test]
async fn remote_close_is_a_connection_error() {
    let mut h = harness(Vec::new(), false);
    let mut errors = h.engine.subscribe_errors();
    let peer = activate(&mut h).await;

    peer.emit(ChannelEvent::Closed {
        reason: Some("quota exceeded".into()),
    });

    let seen = states_until(&mut h.states, SessionState::Closed).await;
    assert_eq!(seen, vec![SessionState::Error, SessionState::Closed]);
    let err = errors.recv().await.unwrap();
    assert_eq!(err.kind, ErrorKind::Connection);
    assert!(err.message.contains("quota exceeded"));
    assert_eq!(h.capture.closes.load(Ordering::SeqCst), 1);

    assert!(matches!(
        h.engine.stop_session().await,
        Err(LiveVoxError::NotRunning)
    ));
}

#[tokio::test]
async fn server_error_payload_ends_session() {
    let mut h = harness(Vec::new(), false);
    let mut errors = h.engine.subscribe_errors();
    let peer = activate(&mut h).await;

    peer.emit(ChannelEvent::Message(message(json!({
        "error": {"code": 400, "message": "invalid model"}
    }))));

    states_until(&mut h.states, SessionState::Closed).await;
    let err = errors.recv().await.unwrap();
    assert_eq!(err.kind, ErrorKind::Connection);
    assert!(err.message.contains("invalid model"));
}

#[tokio::test]
async fn capture_failure_mid_session_is_a_device_error() {
    let mut h = harness(Vec::new(), false);
    let mut errors = h.engine.subscribe_errors();
    let _peer = activate(&mut h).await;

    h.capture.fail("input device disconnected");

    let seen = states_until(&mut h.states, SessionState::Closed).await;
    assert_eq!(seen, vec![SessionState::Error, SessionState::Closed]);
    assert_eq!(errors.recv().await.unwrap().kind, ErrorKind::Device);
    assert_eq!(h.playback.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nothing_is_observed_after_closed() {
    let mut h = harness(Vec::new(), false);
    let peer = activate(&mut h).await;

    h.engine.stop_session().await.unwrap();
    states_until(&mut h.states, SessionState::Closed).await;

    // The controller has dropped its receivers.
    assert!(!peer.emit(ChannelEvent::Message(audio_message(0.5))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        h.states.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(h.playback.scheduled().is_empty());
}

#[tokio::test]
async fn only_one_session_at_a_time() {
    let mut h = harness(Vec::new(), false);
    let _peer = activate(&mut h).await;

    assert!(matches!(
        h.engine.start_session(None),
        Err(LiveVoxError::AlreadyRunning)
    ));

    h.engine.stop_session().await.unwrap();
    states_until(&mut h.states, SessionState::Closed).await;

    let second = h.engine.start_session(None).unwrap();
    let _peer = h.connector.take_peer().await;
    assert_eq!(second, 2);
    h.engine.stop_session().await.unwrap();
}

#[tokio::test]
async fn stop_without_session_is_rejected() {
    let h = harness(Vec::new(), false);
    assert!(matches!(
        h.engine.stop_session().await,
        Err(LiveVoxError::NotRunning)
    ));
    assert_eq!(h.engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn audio_and_interrupt_in_one_message_schedules_then_stops() {
    let mut h = harness(Vec::new(), false);
    let peer = activate(&mut h).await;

    let mut content = audio_json(0.4);
    content["interrupted"] = json!(true);
    peer.emit(ChannelEvent::Message(message(json!({ "serverContent": content }))));

    let playback = Arc::clone(&h.playback);
    eventually("interruption", || !playback.stops.lock().is_empty()).await;

    let scheduled = h.playback.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(*h.playback.stops.lock(), vec![vec![scheduled[0].0]]);

    let diag = h.engine.diagnostics_snapshot();
    assert_eq!(diag.chunks_scheduled, 1);
    assert_eq!(diag.interruptions, 1);
    assert_eq!(h.engine.state(), SessionState::Active);

    h.engine.stop_session().await.unwrap();
}

#[tokio::test]
async fn blocks_before_active_are_discarded_not_sent() {
    let mut h = harness(Vec::new(), false);
    h.engine.start_session(None).unwrap();
    let mut peer = h.connector.take_peer().await;

    let capture = Arc::clone(&h.capture);
    eventually("microphone open", || capture.is_open()).await;
    h.capture.push(block(0.4));
    h.capture.push(block(0.2));

    let engine = &h.engine;
    eventually("discarded blocks", || {
        engine.diagnostics_snapshot().blocks_discarded == 2
    })
    .await;
    assert_eq!(h.engine.state(), SessionState::Connecting);

    h.engine.stop_session().await.unwrap();

    // Nothing but the close request ever reached the transport.
    assert!(matches!(peer.next_outbound().await, Some(Outbound::Close)));
    let diag = h.engine.diagnostics_snapshot();
    assert_eq!(diag.blocks_captured, 2);
    assert_eq!(diag.frames_sent, 0);
}

#[tokio::test]
async fn stop_during_blocked_device_open_does_not_wait_for_it() {
    let mut h = harness(Vec::new(), false);
    h.capture.hold_open.store(true, Ordering::SeqCst);

    h.engine.start_session(None).unwrap();
    let _peer = h.connector.take_peer().await;

    tokio::time::timeout(Duration::from_secs(1), h.engine.stop_session())
        .await
        .expect("stop waited on the device open")
        .unwrap();
    let seen = states_until(&mut h.states, SessionState::Closed).await;
    assert_eq!(
        seen,
        vec![SessionState::Connecting, SessionState::Ending, SessionState::Closed]
    );

    h.capture.hold_open.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn completion_of_stopped_chunk_is_not_counted() {
    let mut h = harness(Vec::new(), false);
    let peer = activate(&mut h).await;

    peer.emit(ChannelEvent::Message(audio_message(0.3)));
    let playback = Arc::clone(&h.playback);
    eventually("first chunk", || playback.scheduled().len() == 1).await;
    let stopped = h.playback.scheduled()[0].0;

    peer.emit(ChannelEvent::Message(message(json!({
        "serverContent": {"interrupted": true}
    }))));
    eventually("interruption", || !playback.stops.lock().is_empty()).await;

    // A late completion for the stopped chunk, then a real one.
    h.playback.finish(stopped);
    peer.emit(ChannelEvent::Message(audio_message(0.1)));
    eventually("second chunk", || playback.scheduled().len() == 2).await;
    h.playback.finish(h.playback.scheduled()[1].0);

    let engine = &h.engine;
    eventually("completion", || engine.diagnostics_snapshot().chunks_completed == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.diagnostics_snapshot().chunks_completed, 1);

    h.engine.stop_session().await.unwrap();
}
