//! Peer roster and the per-peer state machine

use super::session::{PeerSession, SessionState};
use crate::config::GlarePolicy;
use crate::ice::IceServer;
use crate::media::{MediaStream, MediaTrack};
use crate::presentation::PresentationSink;
use crate::signaling::{PeerId, SignalEnvelope, SignalPayload};
use crate::transport::{
    ConnectionFactory, Role, TransportEvent, TransportEventKind, TransportEventSender,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot of one roster entry
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote peer id
    pub peer_id: PeerId,

    /// Session role, `None` while waiting for the remote offer
    pub role: Option<Role>,

    /// Session state, `None` while waiting for the remote offer
    pub state: Option<SessionState>,

    /// Whether the remote peer is sending a stream
    pub has_remote_stream: bool,

    /// Time since the entry was created
    pub age: Duration,
}

enum RosterEntry {
    /// Peer announced, waiting for its first signal
    Pending { since: Instant },
    /// Live session with a connection handle
    Active(PeerSession),
}

/// Owns the roster and drives every session's transitions
///
/// All methods run on the orchestrator's event loop, one at a time.
pub struct PeerRegistry {
    /// Local client id
    self_id: PeerId,

    /// Resolved ICE configuration for new handles
    ice_servers: Vec<IceServer>,

    /// Creates connection handles
    factory: Arc<dyn ConnectionFactory>,

    /// Presentation notifications
    sink: Arc<dyn PresentationSink>,

    /// Queue receiving handle events
    events: TransportEventSender,

    /// Stream attached to every session once connected
    local_stream: Option<MediaStream>,

    /// Which side initiates
    glare_policy: GlarePolicy,

    /// Roster capacity, uncapped when `None`
    max_peers: Option<usize>,

    /// Peer id to entry
    roster: HashMap<PeerId, RosterEntry>,
}

impl PeerRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    ///
    /// * `self_id` - Id assigned by the rendezvous service
    /// * `ice_servers` - Resolved ICE configuration
    /// * `factory` - Connection handle factory
    /// * `sink` - Presentation notifications
    /// * `events` - Queue that handles post their events to
    pub fn new(
        self_id: PeerId,
        ice_servers: Vec<IceServer>,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn PresentationSink>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            self_id,
            ice_servers,
            factory,
            sink,
            events,
            local_stream: None,
            glare_policy: GlarePolicy::Introduction,
            max_peers: None,
            roster: HashMap::new(),
        }
    }

    /// Set the glare policy
    pub fn with_glare_policy(mut self, policy: GlarePolicy) -> Self {
        self.glare_policy = policy;
        self
    }

    /// Cap the roster size (`None` for no cap)
    pub fn with_max_peers(mut self, max_peers: Option<usize>) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Stream to attach on connect
    pub fn with_local_stream(mut self, stream: MediaStream) -> Self {
        self.local_stream = Some(stream);
        self
    }

    /// Local client id
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Number of roster entries, placeholders included
    pub fn len(&self) -> usize {
        self.roster.len()
    }

    /// Whether the roster is empty
    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    /// Whether `peer_id` has a roster entry
    pub fn contains(&self, peer_id: &str) -> bool {
        self.roster.contains_key(peer_id)
    }

    /// Live session for `peer_id`
    pub fn session(&self, peer_id: &str) -> Option<&PeerSession> {
        match self.roster.get(peer_id) {
            Some(RosterEntry::Active(session)) => Some(session),
            _ => None,
        }
    }

    /// Whether `peer_id` is announced but has no handle yet
    pub fn is_pending(&self, peer_id: &str) -> bool {
        matches!(self.roster.get(peer_id), Some(RosterEntry::Pending { .. }))
    }

    /// Number of live connection handles
    pub fn handle_count(&self) -> usize {
        self.roster
            .values()
            .filter(|entry| matches!(entry, RosterEntry::Active(_)))
            .count()
    }

    fn is_full(&self) -> bool {
        self.max_peers.is_some_and(|cap| self.roster.len() >= cap)
    }

    /// Peers already present when we joined
    pub fn on_introduction(&mut self, peer_ids: &[PeerId]) {
        for peer_id in peer_ids {
            self.learn_peer(peer_id, true);
        }
    }

    /// A peer joined after us
    pub fn on_new_user_connected(&mut self, peer_id: &str) {
        self.learn_peer(peer_id, false);
    }

    fn learn_peer(&mut self, peer_id: &str, introduced: bool) {
        if peer_id == self.self_id {
            return;
        }

        if self.roster.contains_key(peer_id) {
            debug!("Peer {} already in roster", peer_id);
            return;
        }

        if self.is_full() {
            warn!(
                "Roster full ({} peers), skipping {}",
                self.roster.len(),
                peer_id
            );
            return;
        }

        if self
            .glare_policy
            .should_initiate(&self.self_id, peer_id, introduced)
        {
            self.open_session(peer_id, Role::Initiator, None);
        } else {
            debug!("Waiting for {} to initiate", peer_id);
            self.roster.insert(
                peer_id.to_string(),
                RosterEntry::Pending {
                    since: Instant::now(),
                },
            );
        }

        self.sink.on_peer_added(peer_id);
    }

    fn open_session(&mut self, peer_id: &str, role: Role, first: Option<SignalPayload>) {
        let handle = self
            .factory
            .create(peer_id, role, &self.ice_servers, self.events.clone());

        info!(
            "Created {} session with {} (connection {})",
            role,
            peer_id,
            handle.connection_id()
        );

        let mut session = PeerSession::new(peer_id.to_string(), role, handle);
        if let Some(payload) = first {
            session.signal(payload);
        }
        self.roster
            .insert(peer_id.to_string(), RosterEntry::Active(session));
    }

    /// Negotiation message relayed by the rendezvous service
    ///
    /// Dropped unless addressed to us. A peer without a handle gets a
    /// responder session; a peer with one gets the payload forwarded.
    pub fn on_signal(&mut self, to: &str, from: &str, payload: SignalPayload) {
        if to != self.self_id {
            debug!("Dropping signal for {} (we are {})", to, self.self_id);
            return;
        }

        if from == self.self_id {
            debug!("Dropping signal from ourselves");
            return;
        }

        let known = match self.roster.get_mut(from) {
            Some(RosterEntry::Active(session)) => {
                session.signal(payload);
                return;
            }
            Some(RosterEntry::Pending { .. }) => true,
            None => false,
        };

        if !known && self.is_full() {
            warn!(
                "Roster full ({} peers), ignoring signal from {}",
                self.roster.len(),
                from
            );
            return;
        }

        self.open_session(from, Role::Responder, Some(payload));

        if !known {
            self.sink.on_peer_added(from);
        }
    }

    /// Event posted by a connection handle
    ///
    /// Returns the outbound signal to relay, if any. Events from handles
    /// that are no longer in the roster are dropped.
    pub fn on_transport_event(&mut self, event: TransportEvent) -> Option<SignalEnvelope> {
        let TransportEvent {
            peer_id,
            connection_id,
            kind,
        } = event;

        let session = match self.roster.get_mut(&peer_id) {
            Some(RosterEntry::Active(session)) if *session.connection_id() == connection_id => {
                session
            }
            _ => {
                debug!(
                    "Dropping stale transport event from {} (connection {})",
                    peer_id, connection_id
                );
                return None;
            }
        };

        match kind {
            TransportEventKind::Signal(payload) => {
                session.note_outbound_signal();
                return Some(SignalEnvelope {
                    to: peer_id,
                    from: self.self_id.clone(),
                    payload,
                });
            }
            TransportEventKind::Connected => {
                if session.mark_connected(self.local_stream.as_ref()) {
                    info!("Connected to peer {}", peer_id);
                }
            }
            TransportEventKind::Stream(stream) => {
                info!("Remote stream {} from peer {}", stream.id(), peer_id);
                session.set_remote_stream(stream.clone());
                self.sink.on_remote_stream(&peer_id, &stream);
            }
            TransportEventKind::Error(message) => {
                warn!("Transport failure with {}: {}", peer_id, message);
                self.remove_peer(&peer_id);
            }
            TransportEventKind::Closed => {
                info!("Transport to {} closed", peer_id);
                self.remove_peer(&peer_id);
            }
        }

        None
    }

    /// A peer left the rendezvous service
    pub fn on_user_disconnected(&mut self, peer_id: &str) {
        if !self.remove_peer(peer_id) {
            debug!("Disconnect for unknown peer {}", peer_id);
        }
    }

    /// Close `peer_id`'s session and drop its entry
    ///
    /// Emits exactly one removal notification. Returns false for unknown ids.
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        let Some(entry) = self.roster.remove(peer_id) else {
            return false;
        };

        if let RosterEntry::Active(mut session) = entry {
            session.close();
        }

        info!("Removed peer {}", peer_id);
        self.sink.on_peer_removed(peer_id);
        true
    }

    /// Close every session and empty the roster
    pub fn teardown_all(&mut self) {
        let mut ids: Vec<PeerId> = self.roster.keys().cloned().collect();
        ids.sort();

        for peer_id in ids {
            self.remove_peer(&peer_id);
        }
    }

    /// Tear down sessions still negotiating after `timeout`
    ///
    /// Placeholders are kept: the remote peer may still call.
    pub fn expire_stalled(&mut self, timeout: Duration) -> Vec<PeerId> {
        let mut stalled: Vec<PeerId> = self
            .roster
            .iter()
            .filter_map(|(id, entry)| match entry {
                RosterEntry::Active(s) if s.state().is_negotiating() && s.age() >= timeout => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();
        stalled.sort();

        for peer_id in &stalled {
            warn!("Negotiation with {} stalled, tearing down", peer_id);
            self.remove_peer(peer_id);
        }

        stalled
    }

    /// Swap the outbound video track on every session carrying the local stream
    pub fn replace_video_track(&mut self, old: Option<&MediaTrack>, new: &MediaTrack) {
        for entry in self.roster.values_mut() {
            if let RosterEntry::Active(session) = entry {
                session.replace_video_track(old, new);
            }
        }
    }

    /// Snapshot of the roster, sorted by peer id
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .roster
            .iter()
            .map(|(id, entry)| match entry {
                RosterEntry::Pending { since } => PeerInfo {
                    peer_id: id.clone(),
                    role: None,
                    state: None,
                    has_remote_stream: false,
                    age: since.elapsed(),
                },
                RosterEntry::Active(session) => PeerInfo {
                    peer_id: id.clone(),
                    role: Some(session.role()),
                    state: Some(session.state()),
                    has_remote_stream: session.remote_stream().is_some(),
                    age: session.age(),
                },
            })
            .collect();

        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        self.teardown_all();
    }
}
