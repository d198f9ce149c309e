//! WebSocket rendezvous client
//!
//! Connects to the rendezvous service, waits for the `welcome` frame that
//! assigns the local client id, then relays frames in both directions from
//! background tasks. Inbound frames become [`SignalingEvent`]s on an mpsc
//! receiver; outbound signals go through a cloneable [`SignalSender`].

use super::protocol::*;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Outbound half of the signaling channel
///
/// Fire-and-forget: there is no acknowledgement and no retry.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<RendezvousMessage>,
}

impl SignalSender {
    /// Create a sender whose frames land on the returned receiver
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<RendezvousMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Relay a negotiation payload to `to`
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` when the connection is already gone.
    pub fn send_signal(&self, to: &str, from: &str, payload: SignalPayload) -> Result<()> {
        debug!("Sending signal {} -> {}", from, to);

        self.tx
            .send(RendezvousMessage::Signal(SignalEnvelope {
                to: to.to_string(),
                from: from.to_string(),
                payload,
            }))
            .map_err(|_| Error::SignalingError("Rendezvous connection closed".to_string()))
    }
}

/// A connected rendezvous session
pub struct SignalingChannel {
    /// Client id assigned by the rendezvous service
    self_id: PeerId,

    /// Outbound frames
    sender: SignalSender,

    /// Inbound events (taken by the orchestrator)
    events: Option<mpsc::UnboundedReceiver<SignalingEvent>>,

    /// Background I/O tasks, aborted on drop
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Assemble a channel from its parts
    ///
    /// Used by [`Rendezvous`] implementations other than WebSocket.
    pub fn new(
        self_id: PeerId,
        sender: SignalSender,
        events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> Self {
        Self {
            self_id,
            sender,
            events: Some(events),
            tasks: Vec::new(),
        }
    }

    /// Local client id
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Outbound sender
    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    /// Take the inbound event receiver
    ///
    /// Returns `None` if it was already taken.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events.take()
    }

    /// Stop the background I/O tasks
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Rendezvous service capability
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Connect and complete the handshake that assigns the local id
    async fn connect(&self) -> Result<SignalingChannel>;
}

/// Rendezvous service reached over WebSocket
pub struct WebSocketRendezvous {
    /// Rendezvous server URL
    url: String,

    /// Maximum wait for the connection and the `welcome` frame
    connect_timeout: Duration,
}

impl WebSocketRendezvous {
    /// Create a rendezvous client
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket URL (ws:// or wss://)
    /// * `connect_timeout` - Maximum wait for the handshake
    pub fn new(url: &str, connect_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout,
        }
    }

    /// Wait for the `welcome` frame
    ///
    /// Frames that arrive before it are kept and replayed afterwards.
    async fn await_welcome(
        read: &mut futures::stream::SplitStream<WsStream>,
    ) -> Result<(PeerId, Vec<SignalingEvent>)> {
        let mut early = Vec::new();

        while let Some(msg) = read.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(Error::WebSocketError(format!("Handshake failed: {}", e))),
            };

            match RendezvousMessage::from_json(&text) {
                Ok(RendezvousMessage::Welcome { id }) => return Ok((id, early)),
                Ok(other) => early.extend(other.into_event()),
                Err(e) => warn!("Ignoring malformed rendezvous frame: {}", e),
            }
        }

        Err(Error::SignalingError(
            "Rendezvous closed before assigning an id".to_string(),
        ))
    }

    /// Sender task: sends frames from channel to WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<RendezvousMessage>,
    ) {
        while let Some(msg) = rx.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Dropping outbound frame: {}", e);
                    continue;
                }
            };

            if let Err(e) = write.send(Message::Text(json)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("Sender task terminated");
    }

    /// Receiver task: parses frames and forwards them as events
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match RendezvousMessage::from_json(&text) {
                    Ok(msg) => {
                        if let Some(event) = msg.into_event() {
                            if events.send(event).is_err() {
                                debug!("Event receiver dropped");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Ignoring rendezvous frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Rendezvous connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        let _ = events.send(SignalingEvent::Disconnected);
        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl Rendezvous for WebSocketRendezvous {
    async fn connect(&self) -> Result<SignalingChannel> {
        info!("Connecting to rendezvous service: {}", self.url);

        let handshake = async {
            let (ws_stream, _) = connect_async(&self.url)
                .await
                .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

            let (write, mut read) = ws_stream.split();
            let (self_id, early) = Self::await_welcome(&mut read).await?;
            Ok::<_, Error>((write, read, self_id, early))
        };

        let (write, read, self_id, early) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "No welcome from {} within {:?}",
                    self.url, self.connect_timeout
                ))
            })??;

        info!("Connected to rendezvous service as {}", self_id);

        let (sender, out_rx) = SignalSender::detached();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        for event in early {
            let _ = events_tx.send(event);
        }

        let mut channel = SignalingChannel::new(self_id, sender, events_rx);
        channel.tasks.push(tokio::spawn(Self::sender_task(write, out_rx)));
        channel
            .tasks
            .push(tokio::spawn(Self::receiver_task(read, events_tx)));

        Ok(channel)
    }
}
