//! WebSocket transport for the Gemini Live bidirectional endpoint.
//!
//! Connect, send `setup`, wait for `setupComplete`, then emit
//! [`ChannelEvent::Open`] and pump both directions until either side closes.
//! The server may deliver JSON in text or binary frames; both are accepted.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::wire::{RealtimeInputMessage, ServerMessage, SetupMessage};
use super::{ChannelEvent, ChannelPeer, Connector, DuplexChannel, Outbound, SessionSetup};
use crate::error::{LiveVoxError, Result};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Endpoint and model settings for [`LiveConnector`].
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    /// Prebuilt voice name.
    pub voice: String,
    pub api_key: String,
    /// Maximum wait for `setupComplete` after connecting.
    pub setup_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            api_key: String::new(),
            setup_timeout: Duration::from_secs(15),
        }
    }
}

/// Opens Gemini Live sessions over a TLS WebSocket.
#[derive(Debug, Clone)]
pub struct LiveConnector {
    config: LiveConfig,
}

impl LiveConnector {
    pub fn new(config: LiveConfig) -> Self {
        // Err only when a process-wide provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { config }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }
}

impl Connector for LiveConnector {
    fn open(&self, setup: SessionSetup) -> DuplexChannel {
        let (mut channel, peer) = DuplexChannel::pair();
        let config = self.config.clone();
        channel.attach_task(tokio::spawn(run_session(config, setup, peer)));
        channel
    }
}

async fn run_session(config: LiveConfig, setup: SessionSetup, mut peer: ChannelPeer) {
    let session_id = setup.session_id;

    // Abandon the handshake if the controller closes while it is in flight.
    let ws = tokio::select! {
        result = connect_and_setup(&config, &setup) => result,
        _ = peer.next_outbound() => {
            debug!(session_id, "channel closed during connect");
            return;
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            warn!(session_id, error = %e, "live connection failed");
            peer.emit(ChannelEvent::Error(e.to_string()));
            return;
        }
    };

    if !peer.emit(ChannelEvent::Open) {
        return;
    }

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            cmd = peer.next_outbound() => match cmd {
                Some(Outbound::Frame(frame)) => {
                    let json = match serde_json::to_string(&RealtimeInputMessage::from(frame)) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(session_id, error = %e, "failed to serialize frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(json)).await {
                        peer.emit(ChannelEvent::Error(format!("send failed: {e}")));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    debug!(session_id, "live connection closed by client");
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => dispatch(&peer, session_id, text.as_bytes()),
                Some(Ok(WsMessage::Binary(data))) => dispatch(&peer, session_id, &data),
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    info!(session_id, ?reason, "live connection closed by server");
                    peer.emit(ChannelEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    peer.emit(ChannelEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    peer.emit(ChannelEvent::Closed { reason: None });
                    break;
                }
            }
        }
    }
}

fn dispatch(peer: &ChannelPeer, session_id: u64, payload: &[u8]) {
    match ServerMessage::parse(payload) {
        Ok(msg) => {
            peer.emit(ChannelEvent::Message(msg));
        }
        Err(e) => warn!(session_id, error = %e, "ignoring unparseable server message"),
    }
}

async fn connect_and_setup(config: &LiveConfig, setup: &SessionSetup) -> Result<WsStream> {
    if config.api_key.trim().is_empty() {
        return Err(LiveVoxError::Connection("API key is not configured".into()));
    }

    info!(
        session_id = setup.session_id,
        endpoint = %config.endpoint,
        model = %config.model,
        "connecting to live endpoint"
    );

    let url = format!("{}?key={}", config.endpoint, config.api_key.trim());
    let (mut ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| LiveVoxError::Connection(format!("connect failed: {e}")))?;

    let setup_msg = SetupMessage::new(
        &config.model,
        &config.voice,
        setup.system_instruction.as_deref(),
    );
    let json = serde_json::to_string(&setup_msg)
        .map_err(|e| LiveVoxError::Connection(format!("setup serialization: {e}")))?;
    ws.send(WsMessage::Text(json))
        .await
        .map_err(|e| LiveVoxError::Connection(format!("setup send failed: {e}")))?;

    match tokio::time::timeout(config.setup_timeout, await_setup_complete(&mut ws)).await {
        Ok(Ok(())) => {
            info!(session_id = setup.session_id, "live setup complete");
            Ok(ws)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(LiveVoxError::Connection(format!(
            "setupComplete timeout ({}s)",
            config.setup_timeout.as_secs()
        ))),
    }
}

async fn await_setup_complete(ws: &mut WsStream) -> Result<()> {
    while let Some(msg) = ws.next().await {
        let payload = match msg {
            Ok(WsMessage::Text(text)) => text.into_bytes(),
            Ok(WsMessage::Binary(data)) => data,
            Ok(WsMessage::Close(frame)) => {
                return Err(LiveVoxError::Connection(format!(
                    "closed before setupComplete: {}",
                    frame.map(|f| f.reason.to_string()).unwrap_or_default()
                )))
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(LiveVoxError::Connection(format!(
                    "error before setupComplete: {e}"
                )))
            }
        };

        match ServerMessage::parse(&payload) {
            Ok(msg) if msg.is_setup_complete() => return Ok(()),
            Ok(ServerMessage {
                error: Some(err), ..
            }) => return Err(LiveVoxError::Connection(err.message)),
            Ok(_) => debug!("ignoring pre-setup message"),
            Err(e) => debug!(error = %e, "ignoring unparseable pre-setup frame"),
        }
    }
    Err(LiveVoxError::Connection(
        "stream ended before setupComplete".into(),
    ))
}
