//! Call lifecycle and event dispatch
//!
//! [`MeshOrchestrator`] owns every piece of mutable state: the local media,
//! the rendezvous connection and the peer roster. Everything that can
//! change that state arrives as a [`MeshInput`] on a single FIFO queue and
//! is handled one item at a time, so nothing here needs a lock.
//!
//! ```text
//! OrchestratorHandle ──commands──┐
//! SignalingChannel ──events──────┼──► MeshInput queue ──► MeshOrchestrator::run
//! ConnectionHandle ──events──────┤                           ├─ MediaSourceManager
//! sweep ticker ──────────────────┘                           └─ PeerRegistry
//! ```

use crate::config::MeshConfig;
use crate::ice::{resolve_ice_servers, IceServer};
use crate::media::{MediaSourceManager, MediaStream, SourceKind, TrackSwap};
use crate::peer::{PeerInfo, PeerRegistry};
use crate::presentation::PresentationSink;
use crate::signaling::{Rendezvous, SignalSender, SignalingChannel, SignalingEvent};
use crate::transport::{ConnectionFactory, TransportEvent};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between stalled-negotiation sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Request from the presentation layer
#[derive(Debug)]
pub enum CallCommand {
    /// Acquire media, join the mesh and reply with the local stream
    StartCall {
        preference: SourceKind,
        reply: oneshot::Sender<Result<MediaStream>>,
    },
    /// Leave the mesh and release local media
    EndCall { reply: oneshot::Sender<()> },
    /// Flip outgoing video, reply with the new state
    ToggleVideo { reply: oneshot::Sender<Result<bool>> },
    /// Flip outgoing audio, reply with the new state
    ToggleMic { reply: oneshot::Sender<Result<bool>> },
    /// Enable or disable all outgoing tracks
    SetOutgoingEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Replace the camera with a screen capture
    SwitchToScreenShare { reply: oneshot::Sender<Result<bool>> },
    /// Replace the screen capture with the camera
    SwitchToCamera { reply: oneshot::Sender<Result<bool>> },
    /// Roster snapshot
    Peers { reply: oneshot::Sender<Vec<PeerInfo>> },
    /// End the call and stop the event loop
    Shutdown { reply: oneshot::Sender<()> },
}

/// Item on the orchestrator queue
#[derive(Debug)]
pub enum MeshInput {
    /// Presentation layer request
    Command(CallCommand),
    /// Rendezvous event for call `generation`
    Signaling {
        generation: u64,
        event: SignalingEvent,
    },
    /// Connection handle event for call `generation`
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    /// Time to expire stalled negotiations
    Sweep,
}

/// State that only exists while a call is active
struct ActiveCall {
    /// Bumped per call so events from an earlier call are dropped
    generation: u64,
    registry: PeerRegistry,
    channel: SignalingChannel,
    signals: SignalSender,
    forwarders: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn teardown(mut self) {
        self.registry.teardown_all();
        self.channel.close();
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }
}

/// Peer mesh orchestrator
pub struct MeshOrchestrator {
    config: MeshConfig,
    ice_servers: Vec<IceServer>,
    media: MediaSourceManager,
    rendezvous: Arc<dyn Rendezvous>,
    factory: Arc<dyn ConnectionFactory>,
    sink: Arc<dyn PresentationSink>,
    call: Option<ActiveCall>,
    generation: u64,
    inbox_tx: mpsc::UnboundedSender<MeshInput>,
    inbox: mpsc::UnboundedReceiver<MeshInput>,
    /// Whether a call is active, observed by handles
    active: watch::Sender<bool>,
}

impl MeshOrchestrator {
    /// Create an orchestrator
    ///
    /// ICE servers are resolved once here.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn new(
        config: MeshConfig,
        media: MediaSourceManager,
        rendezvous: Arc<dyn Rendezvous>,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn PresentationSink>,
    ) -> Result<Self> {
        config.validate()?;

        let ice_servers = resolve_ice_servers(
            &config.ice_server_urls,
            config.ice_username.as_deref(),
            config.ice_credential.as_deref(),
        );
        info!(
            "Resolved {} ICE server(s): {:?}",
            ice_servers.len(),
            ice_servers.iter().flat_map(|s| s.urls.iter()).collect::<Vec<_>>()
        );

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (active, _) = watch::channel(false);

        Ok(Self {
            config,
            ice_servers,
            media,
            rendezvous,
            factory,
            sink,
            call: None,
            generation: 0,
            inbox_tx,
            inbox,
            active,
        })
    }

    /// Handle for sending commands to the running loop
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            tx: self.inbox_tx.clone(),
            active: self.active.subscribe(),
        }
    }

    /// Resolved ICE configuration
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Whether a call is active
    pub fn is_active(&self) -> bool {
        self.call.is_some()
    }

    /// Local client id of the active call
    pub fn self_id(&self) -> Option<&str> {
        self.call.as_ref().map(|c| c.registry.self_id())
    }

    /// Local outbound stream, if acquired
    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.media.stream()
    }

    /// Local media manager
    pub fn media(&self) -> &MediaSourceManager {
        &self.media
    }

    /// Start a call
    ///
    /// Acquires media first, then connects to the rendezvous service. A
    /// second start while a call is active returns the current stream.
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` when no source could be captured, or the
    /// rendezvous error. Either way nothing is left running.
    pub async fn start_call(&mut self, preference: SourceKind) -> Result<MediaStream> {
        if self.call.is_some() {
            debug!("Call already active, ignoring start");
            return self.media.stream().cloned().ok_or(Error::CallNotActive);
        }

        let stream = self.media.acquire(preference).await?.stream.clone();

        let mut channel = match self.rendezvous.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to join mesh: {}", e);
                self.media.release();
                return Err(e);
            }
        };

        let Some(signaling_rx) = channel.take_events() else {
            self.media.release();
            return Err(Error::SignalingError(
                "Signaling events already taken".to_string(),
            ));
        };

        self.generation += 1;
        let generation = self.generation;
        let self_id = channel.self_id().to_string();

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(
            self_id.clone(),
            self.ice_servers.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.sink),
            transport_tx,
        )
        .with_glare_policy(self.config.glare_policy)
        .with_max_peers(self.config.max_peers.map(|cap| cap as usize))
        .with_local_stream(stream.clone());

        let mut forwarders = vec![
            tokio::spawn(forward_signaling(
                signaling_rx,
                self.inbox_tx.clone(),
                generation,
            )),
            tokio::spawn(forward_transport(
                transport_rx,
                self.inbox_tx.clone(),
                generation,
            )),
        ];

        if self.config.negotiation_timeout().is_some() {
            forwarders.push(tokio::spawn(sweep_ticker(self.inbox_tx.clone())));
        }

        self.call = Some(ActiveCall {
            generation,
            registry,
            signals: channel.sender(),
            channel,
            forwarders,
        });

        info!("Joined mesh as {}", self_id);
        self.active.send_replace(true);
        self.sink.on_local_stream_ready(&stream);

        Ok(stream)
    }

    /// End the call
    ///
    /// Closes every session (one removal notification each), disconnects from
    /// the rendezvous service and stops all local tracks.
    pub fn end_call(&mut self) {
        if let Some(call) = self.call.take() {
            info!("Leaving mesh");
            call.teardown();
            self.active.send_replace(false);
        }
        self.media.release();
    }

    /// Flip outgoing video, returning the new state
    pub fn toggle_video(&mut self) -> Result<bool> {
        self.require_media()?;
        Ok(self.media.toggle_video())
    }

    /// Flip outgoing audio, returning the new state
    pub fn toggle_mic(&mut self) -> Result<bool> {
        self.require_media()?;
        Ok(self.media.toggle_mic())
    }

    /// Enable or disable every outgoing track
    pub fn set_outgoing_enabled(&mut self, enabled: bool) -> Result<()> {
        self.require_media()?;
        self.media.set_outgoing_enabled(enabled);
        Ok(())
    }

    /// Replace the video source with a screen capture
    ///
    /// Returns false when the screen was already the source.
    pub async fn switch_to_screen_share(&mut self) -> Result<bool> {
        self.require_media()?;
        let swap = self.media.switch_to_screen_share().await?;
        Ok(self.propagate_swap(swap))
    }

    /// Replace the video source with the camera
    ///
    /// Returns false when the camera was already the source.
    pub async fn switch_to_camera(&mut self) -> Result<bool> {
        self.require_media()?;
        let swap = self.media.switch_to_camera().await?;
        Ok(self.propagate_swap(swap))
    }

    fn require_media(&self) -> Result<()> {
        match self.media.state() {
            Some(_) => Ok(()),
            None => Err(Error::CallNotActive),
        }
    }

    fn propagate_swap(&mut self, swap: Option<TrackSwap>) -> bool {
        let Some(swap) = swap else {
            return false;
        };

        if let Some(call) = self.call.as_mut() {
            call.registry
                .replace_video_track(swap.old.as_ref(), &swap.new);
        }
        true
    }

    /// Roster snapshot, empty without a call
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.call
            .as_ref()
            .map(|c| c.registry.peers())
            .unwrap_or_default()
    }

    /// Dispatch one rendezvous event to the roster
    pub fn handle_signaling_event(&mut self, event: SignalingEvent) {
        let Some(call) = self.call.as_mut() else {
            debug!("No active call, dropping {:?}", event);
            return;
        };

        match event {
            SignalingEvent::Introduction(peer_ids) => {
                info!("Introduced to {} peer(s)", peer_ids.len());
                call.registry.on_introduction(&peer_ids);
            }
            SignalingEvent::NewUserConnected(peer_id) => {
                call.registry.on_new_user_connected(&peer_id);
            }
            SignalingEvent::UserDisconnected(peer_id) => {
                call.registry.on_user_disconnected(&peer_id);
            }
            SignalingEvent::Signal { to, from, payload } => {
                call.registry.on_signal(&to, &from, payload);
            }
            SignalingEvent::Disconnected => {
                warn!("Rendezvous connection lost, ending call");
                self.end_call();
            }
        }
    }

    /// Dispatch one connection handle event, relaying any outbound signal
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(call) = self.call.as_mut() else {
            return;
        };

        if let Some(envelope) = call.registry.on_transport_event(event) {
            if let Err(e) = call
                .signals
                .send_signal(&envelope.to, &envelope.from, envelope.payload)
            {
                warn!("Failed to relay signal to {}: {}", envelope.to, e);
            }
        }
    }

    fn sweep(&mut self) {
        let (Some(call), Some(timeout)) = (self.call.as_mut(), self.config.negotiation_timeout())
        else {
            return;
        };

        let expired = call.registry.expire_stalled(timeout);
        if !expired.is_empty() {
            info!("Expired {} stalled negotiation(s)", expired.len());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.call
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    /// Run the event loop until [`OrchestratorHandle::shutdown`]
    pub async fn run(mut self) {
        info!("Mesh orchestrator running");

        while let Some(input) = self.inbox.recv().await {
            match input {
                MeshInput::Command(command) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                MeshInput::Signaling { generation, event } => {
                    if self.is_current(generation) {
                        self.handle_signaling_event(event);
                    }
                }
                MeshInput::Transport { generation, event } => {
                    if self.is_current(generation) {
                        self.handle_transport_event(event);
                    }
                }
                MeshInput::Sweep => self.sweep(),
            }
        }

        info!("Mesh orchestrator stopped");
    }

    /// Returns false once the loop should stop
    async fn handle_command(&mut self, command: CallCommand) -> bool {
        // A dropped reply receiver only means the caller stopped waiting
        match command {
            CallCommand::StartCall { preference, reply } => {
                let _ = reply.send(self.start_call(preference).await);
            }
            CallCommand::EndCall { reply } => {
                self.end_call();
                let _ = reply.send(());
            }
            CallCommand::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_video());
            }
            CallCommand::ToggleMic { reply } => {
                let _ = reply.send(self.toggle_mic());
            }
            CallCommand::SetOutgoingEnabled { enabled, reply } => {
                let _ = reply.send(self.set_outgoing_enabled(enabled));
            }
            CallCommand::SwitchToScreenShare { reply } => {
                let _ = reply.send(self.switch_to_screen_share().await);
            }
            CallCommand::SwitchToCamera { reply } => {
                let _ = reply.send(self.switch_to_camera().await);
            }
            CallCommand::Peers { reply } => {
                let _ = reply.send(self.peers());
            }
            CallCommand::Shutdown { reply } => {
                self.end_call();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

async fn forward_signaling(
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    inbox: mpsc::UnboundedSender<MeshInput>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if inbox
            .send(MeshInput::Signaling { generation, event })
            .is_err()
        {
            break;
        }
    }
}

async fn forward_transport(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    inbox: mpsc::UnboundedSender<MeshInput>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if inbox
            .send(MeshInput::Transport { generation, event })
            .is_err()
        {
            break;
        }
    }
}

async fn sweep_ticker(inbox: mpsc::UnboundedSender<MeshInput>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;
        if inbox.send(MeshInput::Sweep).is_err() {
            break;
        }
    }
}

/// Cloneable command surface of a running orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<MeshInput>,
    active: watch::Receiver<bool>,
}

impl OrchestratorHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> CallCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MeshInput::Command(command(reply)))
            .map_err(|_| Error::OrchestratorStopped)?;
        rx.await.map_err(|_| Error::OrchestratorStopped)
    }

    /// Start a call with the given media preference
    pub async fn start_call(&self, preference: SourceKind) -> Result<MediaStream> {
        self.request(|reply| CallCommand::StartCall { preference, reply })
            .await?
    }

    /// End the active call
    pub async fn end_call(&self) -> Result<()> {
        self.request(|reply| CallCommand::EndCall { reply }).await
    }

    /// Flip outgoing video
    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(|reply| CallCommand::ToggleVideo { reply })
            .await?
    }

    /// Flip outgoing audio
    pub async fn toggle_mic(&self) -> Result<bool> {
        self.request(|reply| CallCommand::ToggleMic { reply }).await?
    }

    /// Enable or disable all outgoing tracks
    pub async fn set_outgoing_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| CallCommand::SetOutgoingEnabled { enabled, reply })
            .await?
    }

    /// Switch the video source to the screen
    pub async fn switch_to_screen_share(&self) -> Result<bool> {
        self.request(|reply| CallCommand::SwitchToScreenShare { reply })
            .await?
    }

    /// Switch the video source to the camera
    pub async fn switch_to_camera(&self) -> Result<bool> {
        self.request(|reply| CallCommand::SwitchToCamera { reply })
            .await?
    }

    /// Roster snapshot
    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(|reply| CallCommand::Peers { reply }).await
    }

    /// End the call and stop the event loop
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| CallCommand::Shutdown { reply }).await
    }

    /// Whether a call is currently active
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Wait until no call is active
    ///
    /// Resolves when the call ends for any reason, including loss of the
    /// rendezvous connection, or when the orchestrator is dropped. Returns
    /// immediately if no call is active.
    pub async fn call_ended(&self) {
        let mut active = self.active.clone();
        let _ = active.wait_for(|active| !*active).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticDevices;
    use crate::presentation::LoggingSink;
    use crate::transport::{ConnectionHandle, ConnectionId, Role, TransportEventSender};
    use async_trait::async_trait;

    struct NullHandle(ConnectionId);

    impl ConnectionHandle for NullHandle {
        fn connection_id(&self) -> &ConnectionId {
            &self.0
        }
        fn signal(&mut self, _payload: crate::signaling::SignalPayload) {}
        fn add_stream(&mut self, _stream: &MediaStream) {}
        fn replace_track(
            &mut self,
            _old: Option<&crate::media::MediaTrack>,
            _new: &crate::media::MediaTrack,
        ) {
        }
        fn detach(&mut self) {}
        fn close(&mut self) {}
    }

    struct NullFactory;

    impl ConnectionFactory for NullFactory {
        fn create(
            &self,
            _peer_id: &str,
            _role: Role,
            _ice_servers: &[IceServer],
            _events: TransportEventSender,
        ) -> Box<dyn ConnectionHandle> {
            Box::new(NullHandle(ConnectionId::new()))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Rendezvous for Unreachable {
        async fn connect(&self) -> Result<SignalingChannel> {
            Err(Error::WebSocketError("connection refused".to_string()))
        }
    }

    fn orchestrator(config: MeshConfig) -> Result<MeshOrchestrator> {
        MeshOrchestrator::new(
            config,
            MediaSourceManager::new(Arc::new(SyntheticDevices::new())),
            Arc::new(Unreachable),
            Arc::new(NullFactory),
            Arc::new(LoggingSink),
        )
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = orchestrator(MeshConfig::new("http://localhost")).err().unwrap();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_ice_resolved_at_construction() {
        let config = MeshConfig::default().with_ice_servers("turn.example.com:3478");
        let orch = orchestrator(config).unwrap();
        assert_eq!(orch.ice_servers().len(), 1);
        assert!(orch.ice_servers()[0].is_relay());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_clean_state() {
        let mut orch = orchestrator(MeshConfig::default()).unwrap();

        let err = orch.start_call(SourceKind::CameraMic).await.unwrap_err();
        assert!(matches!(err, Error::WebSocketError(_)));
        assert!(!orch.is_active());
        assert!(orch.local_stream().is_none());
        assert!(matches!(orch.toggle_video(), Err(Error::CallNotActive)));
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let orch = orchestrator(MeshConfig::default()).unwrap();
        let handle = orch.handle();
        let task = tokio::spawn(orch.run());

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(
            handle.peers().await,
            Err(Error::OrchestratorStopped)
        ));
        assert!(!handle.is_active());
        tokio::time::timeout(Duration::from_secs(1), handle.call_ended())
            .await
            .unwrap();
    }
}
