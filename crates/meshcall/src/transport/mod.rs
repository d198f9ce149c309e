//! Peer connection capability
//!
//! A connection handle negotiates offer/answer and ICE for one remote peer.
//! Handles never call back into the registry: everything they observe is
//! posted as a [`TransportEvent`] onto the orchestrator's queue, tagged with
//! the [`ConnectionId`] of the handle so late events from a closed handle
//! can be recognised and dropped.

pub mod rtc;

use crate::ice::IceServer;
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{PeerId, SignalPayload};
use std::fmt;
use tokio::sync::mpsc;

pub use rtc::WebRtcConnectionFactory;

/// Which side of the pair sends the first offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends the first offer
    Initiator,
    /// Waits for the remote offer
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Identity of one connection handle instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh connection id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a connection handle observed
#[derive(Debug, Clone)]
pub enum TransportEventKind {
    /// Negotiation message to relay to the remote peer
    Signal(SignalPayload),
    /// Transport is up
    Connected,
    /// Remote peer started sending a stream
    Stream(MediaStream),
    /// Transport failed; the connection is unusable
    Error(String),
    /// Transport closed
    Closed,
}

/// Event posted by a connection handle
#[derive(Debug, Clone)]
pub struct TransportEvent {
    /// Remote peer the handle belongs to
    pub peer_id: PeerId,
    /// Handle that produced the event
    pub connection_id: ConnectionId,
    /// What happened
    pub kind: TransportEventKind,
}

/// Sending half of the transport event queue
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One negotiated connection to a remote peer
///
/// Calls must not block: implementations queue work and report results
/// through the event queue.
pub trait ConnectionHandle: Send {
    /// Identity of this handle
    fn connection_id(&self) -> &ConnectionId;

    /// Feed a negotiation message received from the remote peer
    fn signal(&mut self, payload: SignalPayload);

    /// Send the local stream to the remote peer
    fn add_stream(&mut self, stream: &MediaStream);

    /// Swap an outbound track for another of the same kind
    fn replace_track(&mut self, old: Option<&MediaTrack>, new: &MediaTrack);

    /// Stop reporting events; nothing is posted after this returns
    fn detach(&mut self);

    /// Close the connection and release its resources
    fn close(&mut self);
}

/// Creates connection handles
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection to `peer_id`
    ///
    /// # Arguments
    ///
    /// * `peer_id` - Remote peer
    /// * `role` - Whether this side sends the first offer
    /// * `ice_servers` - Resolved ICE configuration
    /// * `events` - Queue receiving the handle's events
    fn create(
        &self,
        peer_id: &str,
        role: Role,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Box<dyn ConnectionHandle>;
}
