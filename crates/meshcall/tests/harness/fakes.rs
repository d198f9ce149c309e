//! In-memory connection factory and rendezvous

use async_trait::async_trait;
use meshcall::{
    ConnectionFactory, ConnectionHandle, ConnectionId, Error, IceServer, MediaStream,
    MediaTrack, Rendezvous, Result, Role, SignalPayload, SignalSender, SignalingChannel,
    SignalingEvent, TransportEvent, TransportEventKind,
};
use meshcall::signaling::RendezvousMessage;
use meshcall::transport::TransportEventSender;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a recorded handle was asked to do
#[derive(Debug, Default)]
pub struct HandleLog {
    pub signals: Vec<SignalPayload>,
    pub streams: Vec<MediaStream>,
    /// (old track id, new track id)
    pub replaced: Vec<(Option<String>, String)>,
    pub detached: bool,
    pub closed: bool,
}

/// One handle created by [`RecordingFactory`]
#[derive(Clone)]
pub struct HandleRecord {
    pub peer_id: String,
    pub role: Role,
    pub connection_id: ConnectionId,
    pub ice_servers: Vec<IceServer>,
    events: TransportEventSender,
    log: Arc<Mutex<HandleLog>>,
}

impl HandleRecord {
    /// Post a transport event as if the handle produced it
    ///
    /// Ignores detachment so tests can exercise stale-event filtering.
    pub fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(self.event(kind));
    }

    /// Build the event this handle would post
    pub fn event(&self, kind: TransportEventKind) -> TransportEvent {
        TransportEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id.clone(),
            kind,
        }
    }

    pub fn log(&self) -> MutexGuard<'_, HandleLog> {
        self.log.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }
}

struct RecordingHandle {
    connection_id: ConnectionId,
    log: Arc<Mutex<HandleLog>>,
}

impl ConnectionHandle for RecordingHandle {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn signal(&mut self, payload: SignalPayload) {
        self.log.lock().signals.push(payload);
    }

    fn add_stream(&mut self, stream: &MediaStream) {
        self.log.lock().streams.push(stream.clone());
    }

    fn replace_track(&mut self, old: Option<&MediaTrack>, new: &MediaTrack) {
        self.log
            .lock()
            .replaced
            .push((old.map(|t| t.id().to_string()), new.id().to_string()));
    }

    fn detach(&mut self) {
        self.log.lock().detached = true;
    }

    fn close(&mut self) {
        self.log.lock().closed = true;
    }
}

/// Connection factory recording every handle it creates
#[derive(Clone, Default)]
pub struct RecordingFactory {
    handles: Arc<Mutex<Vec<HandleRecord>>>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handle created so far, in creation order
    pub fn handles(&self) -> Vec<HandleRecord> {
        self.handles.lock().clone()
    }

    /// Handles created for `peer_id`
    pub fn handles_for(&self, peer_id: &str) -> Vec<HandleRecord> {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Handles for `peer_id` that are not closed
    pub fn live_handles_for(&self, peer_id: &str) -> Vec<HandleRecord> {
        self.handles_for(peer_id)
            .into_iter()
            .filter(|h| !h.is_closed())
            .collect()
    }

    /// Most recent handle for `peer_id`
    pub fn last_for(&self, peer_id: &str) -> Option<HandleRecord> {
        self.handles_for(peer_id).pop()
    }
}

impl ConnectionFactory for RecordingFactory {
    fn create(
        &self,
        peer_id: &str,
        role: Role,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Box<dyn ConnectionHandle> {
        let log = Arc::new(Mutex::new(HandleLog::default()));
        let connection_id = ConnectionId::new();

        self.handles.lock().push(HandleRecord {
            peer_id: peer_id.to_string(),
            role,
            connection_id: connection_id.clone(),
            ice_servers: ice_servers.to_vec(),
            events,
            log: Arc::clone(&log),
        });

        Box::new(RecordingHandle { connection_id, log })
    }
}

/// Test side of one scripted rendezvous connection
pub struct RendezvousLink {
    pub self_id: String,
    events: mpsc::UnboundedSender<SignalingEvent>,
    outbound: Mutex<mpsc::UnboundedReceiver<RendezvousMessage>>,
}

impl RendezvousLink {
    /// Deliver an inbound event to the orchestrator
    pub fn deliver(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    /// Frames the orchestrator sent so far
    pub fn sent(&self) -> Vec<RendezvousMessage> {
        let mut outbound = self.outbound.lock();
        let mut frames = Vec::new();
        while let Ok(frame) = outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Rendezvous whose events are injected by the test
pub struct ScriptedRendezvous {
    self_id: String,
    refuse: AtomicBool,
    connects: AtomicUsize,
    links: Mutex<Vec<Arc<RendezvousLink>>>,
}

impl ScriptedRendezvous {
    /// Rendezvous assigning `self_id` on every connect
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent connects fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most recent connection
    pub fn link(&self) -> Arc<RendezvousLink> {
        self.links
            .lock()
            .last()
            .cloned()
            .expect("rendezvous never connected")
    }
}

#[async_trait]
impl Rendezvous for ScriptedRendezvous {
    async fn connect(&self) -> Result<SignalingChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::WebSocketError("connection refused".to_string()));
        }

        let (sender, outbound) = SignalSender::detached();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        self.links.lock().push(Arc::new(RendezvousLink {
            self_id: self.self_id.clone(),
            events: events_tx,
            outbound: Mutex::new(outbound),
        }));

        Ok(SignalingChannel::new(self.self_id.clone(), sender, events_rx))
    }
}
