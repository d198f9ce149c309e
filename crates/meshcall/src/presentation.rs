//! Notifications for the presentation layer
//!
//! The orchestrator never renders anything. It tells a [`PresentationSink`]
//! which peers appeared, which streams arrived and which peers left, keyed
//! by peer id.

use crate::media::MediaStream;
use crate::signaling::PeerId;
use tokio::sync::mpsc;
use tracing::info;

/// Receives stream attach/detach notifications
///
/// Called from the orchestrator's event loop; implementations must not block.
pub trait PresentationSink: Send + Sync {
    /// A roster entry was created for `peer_id`
    fn on_peer_added(&self, _peer_id: &str) {}

    /// `peer_id` started sending `stream`
    fn on_remote_stream(&self, peer_id: &str, stream: &MediaStream);

    /// `peer_id` left; drop anything bound to it
    fn on_peer_removed(&self, peer_id: &str);

    /// Local stream is ready for preview
    fn on_local_stream_ready(&self, stream: &MediaStream);
}

/// Notification published by [`ChannelSink`]
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Roster entry created
    PeerAdded(PeerId),

    /// Remote stream attached
    RemoteStream {
        /// Sending peer
        peer_id: PeerId,
        /// Inbound stream
        stream: MediaStream,
    },

    /// Peer removed from the roster
    PeerRemoved(PeerId),

    /// Local preview stream ready
    LocalStreamReady(MediaStream),
}

/// Sink publishing every notification on an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver of its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn publish(&self, event: MeshEvent) {
        // Receiver gone means nobody is watching
        let _ = self.tx.send(event);
    }
}

impl PresentationSink for ChannelSink {
    fn on_peer_added(&self, peer_id: &str) {
        self.publish(MeshEvent::PeerAdded(peer_id.to_string()));
    }

    fn on_remote_stream(&self, peer_id: &str, stream: &MediaStream) {
        self.publish(MeshEvent::RemoteStream {
            peer_id: peer_id.to_string(),
            stream: stream.clone(),
        });
    }

    fn on_peer_removed(&self, peer_id: &str) {
        self.publish(MeshEvent::PeerRemoved(peer_id.to_string()));
    }

    fn on_local_stream_ready(&self, stream: &MediaStream) {
        self.publish(MeshEvent::LocalStreamReady(stream.clone()));
    }
}

/// Sink that only logs, for headless peers
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl PresentationSink for LoggingSink {
    fn on_peer_added(&self, peer_id: &str) {
        info!("Peer joined: {}", peer_id);
    }

    fn on_remote_stream(&self, peer_id: &str, stream: &MediaStream) {
        info!(
            "Remote stream from {}: audio={}, video={}",
            peer_id,
            stream.has_audio(),
            stream.has_video()
        );
    }

    fn on_peer_removed(&self, peer_id: &str) {
        info!("Peer left: {}", peer_id);
    }

    fn on_local_stream_ready(&self, stream: &MediaStream) {
        info!(
            "Local stream ready: {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );
    }
}
