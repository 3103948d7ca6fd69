//! Duplex session channel to the remote model.
//!
//! A [`DuplexChannel`] is the controller's half of a connection: an ordered
//! outbound frame queue and an inbound event stream. The transport half
//! ([`ChannelPeer`]) is driven by a background task owned by the channel;
//! [`live::LiveConnector`] provides the WebSocket transport.
//!
//! ```text
//! controller ──send(frame)──► outbound queue ──► transport task ──► wire
//! controller ◄──recv()─────── event queue   ◄── transport task ◄── wire
//! ```

pub mod live;
pub mod wire;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::TransportFrame;

pub use wire::ServerMessage;

/// Default bound on awaiting the transport task during `close`.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Inbound lifecycle and message events.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The remote side accepted the session; frames may now be sent.
    Open,
    Message(ServerMessage),
    /// The remote side closed the connection.
    Closed { reason: Option<String> },
    /// The connection failed.
    Error(String),
}

/// Commands from the controller to the transport task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(TransportFrame),
    Close,
}

/// What the controller asks of a new connection.
#[derive(Debug, Clone, Default)]
pub struct SessionSetup {
    pub session_id: u64,
    /// System instruction (persona) for the model, if any.
    pub system_instruction: Option<String>,
}

/// Starts connection attempts. Implementations must not block: the attempt
/// runs on a spawned task and reports through the returned channel.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, setup: SessionSetup) -> DuplexChannel;
}

/// Controller half of one connection.
pub struct DuplexChannel {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    task: Option<JoinHandle<()>>,
    close_timeout: Duration,
    closed: bool,
}

/// Transport half of one connection.
pub struct ChannelPeer {
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl DuplexChannel {
    /// Create a connected controller/transport pair.
    pub fn pair() -> (DuplexChannel, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (
            DuplexChannel {
                outbound: Some(out_tx),
                events: ev_rx,
                task: None,
                close_timeout: DEFAULT_CLOSE_TIMEOUT,
                closed: false,
            },
            ChannelPeer {
                events: ev_tx,
                outbound: out_rx,
            },
        )
    }

    /// Hand ownership of the transport task to the channel so `close` can
    /// await it.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    pub fn set_close_timeout(&mut self, timeout: Duration) {
        self.close_timeout = timeout;
    }

    /// Queue a frame for sending. Never blocks; returns `false` if the
    /// transport has already gone away or the channel is closed.
    pub fn send(&self, frame: TransportFrame) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Outbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Next inbound event. `None` once the transport is gone or after `close`.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the connection and wait for the transport task to finish.
    /// Idempotent; events still queued are discarded.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.close_timeout, &mut task).await {
                Ok(Ok(())) => debug!("transport task finished"),
                Ok(Err(e)) if e.is_panic() => warn!("transport task panicked"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(
                        timeout_ms = self.close_timeout.as_millis() as u64,
                        "transport task did not finish in time; aborting"
                    );
                    task.abort();
                }
            }
        }

        self.events.close();
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl ChannelPeer {
    /// Deliver an event to the controller. Returns `false` if it has hung up.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Next command from the controller. `None` once the controller side is
    /// dropped or closed.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: &str) -> TransportFrame {
        TransportFrame {
            data: tag.into(),
            mime_type: "audio/pcm;rate=16000".into(),
        }
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (channel, mut peer) = DuplexChannel::pair();
        for tag in ["a", "b", "c"] {
            assert!(channel.send(frame(tag)));
        }
        for tag in ["a", "b", "c"] {
            match peer.next_outbound().await {
                Some(Outbound::Frame(f)) => assert_eq!(f.data, tag),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn events_flow_to_controller() {
        let (mut channel, peer) = DuplexChannel::pair();
        assert!(peer.emit(ChannelEvent::Open));
        assert!(matches!(channel.recv().await, Some(ChannelEvent::Open)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_silences_events() {
        let (mut channel, mut peer) = DuplexChannel::pair();
        let task = tokio::spawn(async move {
            while let Some(cmd) = peer.next_outbound().await {
                if matches!(cmd, Outbound::Close) {
                    peer.emit(ChannelEvent::Closed { reason: None });
                    break;
                }
            }
        });
        channel.attach_task(task);

        channel.close().await;
        channel.close().await;

        assert!(channel.is_closed());
        assert!(channel.recv().await.is_none());
        assert!(!channel.send(frame("late")));
    }

    #[tokio::test]
    async fn close_aborts_stuck_transport() {
        let (mut channel, _peer) = DuplexChannel::pair();
        channel.set_close_timeout(Duration::from_millis(20));
        channel.attach_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        tokio::time::timeout(Duration::from_secs(1), channel.close())
            .await
            .expect("close must not hang");
    }
}
