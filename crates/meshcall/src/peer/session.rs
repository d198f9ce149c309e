//! One remote participant's connection

use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{PeerId, SignalPayload};
use crate::transport::{ConnectionHandle, ConnectionId, Role};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Session lifecycle
///
/// `Created -> SignalExchange -> Connected -> Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handle created, nothing exchanged yet
    Created,
    /// Offer/answer or candidates in flight
    SignalExchange,
    /// Transport is up
    Connected,
    /// Handle closed
    Closed,
}

impl SessionState {
    /// Whether negotiation has not finished yet
    pub fn is_negotiating(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::SignalExchange)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::SignalExchange => write!(f, "signal-exchange"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Connection to one remote peer
///
/// Owns its connection handle exclusively. The handle is detached and closed
/// when the session closes or is dropped.
pub struct PeerSession {
    id: PeerId,
    role: Role,
    state: SessionState,
    handle: Box<dyn ConnectionHandle>,
    remote_stream: Option<MediaStream>,
    local_stream_attached: bool,
    created_at: Instant,
}

impl PeerSession {
    /// Create a session in `Created` around a fresh handle
    pub fn new(id: PeerId, role: Role, handle: Box<dyn ConnectionHandle>) -> Self {
        Self {
            id,
            role,
            state: SessionState::Created,
            handle,
            remote_stream: None,
            local_stream_attached: false,
            created_at: Instant::now(),
        }
    }

    /// Remote peer id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Role, fixed at creation
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity of the owned handle
    pub fn connection_id(&self) -> &ConnectionId {
        self.handle.connection_id()
    }

    /// Inbound stream, if the remote peer sent one
    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// Whether the local stream was handed to the transport
    pub fn local_stream_attached(&self) -> bool {
        self.local_stream_attached
    }

    /// Time since the session was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn begin_exchange(&mut self) {
        if self.state == SessionState::Created {
            self.state = SessionState::SignalExchange;
        }
    }

    /// Feed a negotiation message from the remote peer into the handle
    pub fn signal(&mut self, payload: SignalPayload) {
        if self.state == SessionState::Closed {
            return;
        }
        self.begin_exchange();
        self.handle.signal(payload);
    }

    /// The handle produced a negotiation message for the remote peer
    pub fn note_outbound_signal(&mut self) {
        self.begin_exchange();
    }

    /// Transport reported connected
    ///
    /// Attaches `local` once. Returns false if the session was not
    /// negotiating.
    pub fn mark_connected(&mut self, local: Option<&MediaStream>) -> bool {
        if !self.state.is_negotiating() {
            return false;
        }
        self.state = SessionState::Connected;

        if let Some(stream) = local {
            self.attach_local_stream(stream);
        }
        true
    }

    /// Hand the local stream to the transport, once
    pub fn attach_local_stream(&mut self, stream: &MediaStream) {
        if self.local_stream_attached || self.state == SessionState::Closed {
            return;
        }
        self.handle.add_stream(stream);
        self.local_stream_attached = true;
    }

    /// Record the inbound stream
    pub fn set_remote_stream(&mut self, stream: MediaStream) {
        self.remote_stream = Some(stream);
    }

    /// Swap the outbound video track, if the local stream was attached
    pub fn replace_video_track(&mut self, old: Option<&MediaTrack>, new: &MediaTrack) {
        if self.local_stream_attached && self.state != SessionState::Closed {
            self.handle.replace_track(old, new);
        }
    }

    /// Detach callbacks and close the handle
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        debug!("Closing session with {} ({})", self.id, self.state);
        self.handle.detach();
        self.handle.close();
        self.remote_stream = None;
        self.state = SessionState::Closed;
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("connection_id", self.handle.connection_id())
            .field("has_remote_stream", &self.remote_stream.is_some())
            .finish()
    }
}
