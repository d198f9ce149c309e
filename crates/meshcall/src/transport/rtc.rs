//! WebRTC connection handles built on webrtc-rs
//!
//! Each handle owns a background task holding the `RTCPeerConnection`.
//! Handle calls are turned into commands on an unbounded channel, so they
//! never block the orchestrator and are applied strictly in order.
//!
//! Negotiation payloads use the simple-peer shapes so browser peers can
//! join the same mesh:
//!
//! ```json
//! {"type": "offer", "sdp": "..."}
//! {"type": "answer", "sdp": "..."}
//! {"type": "candidate", "candidate": {"candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0}}
//! {"type": "renegotiate"}
//! ```

use super::{
    ConnectionFactory, ConnectionHandle, ConnectionId, Role, TransportEvent, TransportEventKind,
    TransportEventSender,
};
use crate::ice::IceServer;
use crate::media::{EncodedSample, MediaStream, MediaTrack, TrackKind};
use crate::signaling::SignalPayload;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Label of the data channel opened by the initiator
pub const DATA_CHANNEL_LABEL: &str = "meshcall";

/// Negotiation messages understood by this transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NegotiationMessage {
    /// SDP offer
    Offer {
        /// Session description
        sdp: String,
    },
    /// SDP answer
    Answer {
        /// Session description
        sdp: String,
    },
    /// Trickled ICE candidate
    Candidate {
        /// Candidate in browser JSON form
        candidate: RTCIceCandidateInit,
    },
    /// Responder asks the initiator for a fresh offer
    Renegotiate,
}

impl NegotiationMessage {
    /// Parse from an opaque signal payload
    pub fn from_payload(payload: SignalPayload) -> Result<Self> {
        serde_json::from_value(payload).map_err(|e| {
            Error::SerializationError(format!("Unrecognised negotiation payload: {}", e))
        })
    }

    /// Convert into an opaque signal payload
    pub fn to_payload(&self) -> Result<SignalPayload> {
        serde_json::to_value(self).map_err(|e| {
            Error::SerializationError(format!("Failed to encode negotiation payload: {}", e))
        })
    }
}

/// Convert resolved ICE servers to webrtc-rs configuration
pub fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| {
            RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            }
        })
        .collect()
}

/// Creates webrtc-rs backed connection handles
///
/// One `API` (media engine and interceptors) is shared by every connection.
pub struct WebRtcConnectionFactory {
    api: Arc<API>,
}

impl WebRtcConnectionFactory {
    /// Build the shared WebRTC API with default codecs and interceptors
    pub fn new() -> Result<Self> {
        Self::with_setting_engine(SettingEngine::default())
    }

    /// Same as [`new`](Self::new) with custom ICE and transport settings
    pub fn with_setting_engine(setting_engine: SettingEngine) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

impl ConnectionFactory for WebRtcConnectionFactory {
    fn create(
        &self,
        peer_id: &str,
        role: Role,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Box<dyn ConnectionHandle> {
        let connection_id = ConnectionId::new();
        let detached = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            "Creating peer connection: peer_id={}, connection_id={}, role={}",
            peer_id, connection_id, role
        );

        let emitter = Emitter {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.clone(),
            events,
            detached: Arc::clone(&detached),
        };

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let span = info_span!("connection", peer_id = %peer_id, role = %role);
        tokio::spawn(run_connection(Arc::clone(&self.api), config, role, rx, emitter).instrument(span));

        Box::new(WebRtcConnection {
            connection_id,
            commands: tx,
            detached,
            closed: false,
        })
    }
}

/// Work queued for the connection task
enum Command {
    Signal(SignalPayload),
    AddStream(MediaStream),
    ReplaceTrack {
        old: Option<String>,
        new: MediaTrack,
    },
    Close,
}

/// Handle to a webrtc-rs connection task
struct WebRtcConnection {
    connection_id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    detached: Arc<AtomicBool>,
    closed: bool,
}

impl WebRtcConnection {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Connection task {} already finished", self.connection_id);
        }
    }
}

impl ConnectionHandle for WebRtcConnection {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn signal(&mut self, payload: SignalPayload) {
        self.send(Command::Signal(payload));
    }

    fn add_stream(&mut self, stream: &MediaStream) {
        self.send(Command::AddStream(stream.clone()));
    }

    fn replace_track(&mut self, old: Option<&MediaTrack>, new: &MediaTrack) {
        self.send(Command::ReplaceTrack {
            old: old.map(|t| t.id().to_string()),
            new: new.clone(),
        });
    }

    fn detach(&mut self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.detach();
        self.send(Command::Close);
    }
}

impl Drop for WebRtcConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Posts transport events unless the handle was detached
#[derive(Clone)]
struct Emitter {
    peer_id: String,
    connection_id: ConnectionId,
    events: TransportEventSender,
    detached: Arc<AtomicBool>,
}

impl Emitter {
    fn emit(&self, kind: TransportEventKind) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }

        let _ = self.events.send(TransportEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id.clone(),
            kind,
        });
    }

    fn signal(&self, message: &NegotiationMessage) {
        match message.to_payload() {
            Ok(payload) => self.emit(TransportEventKind::Signal(payload)),
            Err(e) => warn!("Dropping outbound negotiation message: {}", e),
        }
    }
}

/// Connection task: owns the peer connection until closed
async fn run_connection(
    api: Arc<API>,
    config: RTCConfiguration,
    role: Role,
    mut commands: mpsc::UnboundedReceiver<Command>,
    emitter: Emitter,
) {
    let pc = match api.new_peer_connection(config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            let err =
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e));
            warn!("Peer {}: {}", emitter.peer_id, err);
            emitter.emit(TransportEventKind::Error(err.to_string()));
            return;
        }
    };

    let mut negotiator = Negotiator::new(pc, role, emitter);
    negotiator.install_handlers();

    if role == Role::Initiator {
        if let Err(e) = negotiator.start().await {
            negotiator.fail(e);
        }
    }

    while let Some(command) = commands.recv().await {
        let result = match command {
            Command::Signal(payload) => negotiator.handle_signal(payload).await,
            Command::AddStream(stream) => negotiator.add_stream(&stream).await,
            Command::ReplaceTrack { old, new } => negotiator.replace_track(old, &new).await,
            Command::Close => break,
        };

        if let Err(e) = result {
            negotiator.fail(e);
        }
    }

    negotiator.shutdown().await;
}

/// Offer/answer state for one peer connection
struct Negotiator {
    pc: Arc<RTCPeerConnection>,
    role: Role,
    emitter: Emitter,

    /// Remote candidates received before the remote description
    pending_candidates: Vec<RTCIceCandidateInit>,

    /// Outbound senders by local track id
    senders: HashMap<String, OutboundTrack>,

    /// Inbound streams by remote stream id
    remote_streams: Arc<Mutex<HashMap<String, MediaStream>>>,

    /// An offer was requested while another was in flight
    renegotiate_pending: bool,
}

impl Negotiator {
    fn new(pc: Arc<RTCPeerConnection>, role: Role, emitter: Emitter) -> Self {
        Self {
            pc,
            role,
            emitter,
            pending_candidates: Vec::new(),
            senders: HashMap::new(),
            remote_streams: Arc::new(Mutex::new(HashMap::new())),
            renegotiate_pending: false,
        }
    }

    fn install_handlers(&self) {
        let emitter = self.emitter.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => emitter.signal(&NegotiationMessage::Candidate { candidate: init }),
                        Err(e) => warn!("Failed to encode local ICE candidate: {}", e),
                    }
                })
            }));

        let emitter = self.emitter.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    debug!("Peer {} connection state: {}", emitter.peer_id, s);
                    match s {
                        RTCPeerConnectionState::Connected => {
                            emitter.emit(TransportEventKind::Connected)
                        }
                        RTCPeerConnectionState::Failed => emitter.emit(TransportEventKind::Error(
                            "ICE connection failed".to_string(),
                        )),
                        RTCPeerConnectionState::Closed => emitter.emit(TransportEventKind::Closed),
                        _ => {}
                    }
                })
            }));

        let emitter = self.emitter.clone();
        let remote_streams = Arc::clone(&self.remote_streams);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let emitter = emitter.clone();
                let remote_streams = Arc::clone(&remote_streams);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };

                    let stream_id = track.stream_id();
                    let media = MediaTrack::from_remote(track.id(), kind, Arc::clone(&track));

                    let (stream, first_track) = {
                        let mut streams = remote_streams.lock();
                        match streams.get(&stream_id) {
                            Some(stream) => (stream.clone(), false),
                            None => {
                                let stream = MediaStream::with_id(stream_id.clone());
                                streams.insert(stream_id, stream.clone());
                                (stream, true)
                            }
                        }
                    };

                    debug!("Remote {} track from peer {}", kind, emitter.peer_id);
                    stream.add_track(media);

                    if first_track {
                        emitter.emit(TransportEventKind::Stream(stream));
                    }
                })
            },
        ));
    }

    /// Open the data channel and send the first offer
    async fn start(&mut self) -> Result<()> {
        self.pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create data channel: {}", e)))?;

        self.offer().await
    }

    async fn offer(&mut self) -> Result<()> {
        if self.pc.signaling_state() != RTCSignalingState::Stable {
            debug!("Offer in flight, renegotiating once it settles");
            self.renegotiate_pending = true;
            return Ok(());
        }

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let sdp = self.local_sdp().await?;
        debug!("Created SDP offer for peer {}", self.emitter.peer_id);
        self.emitter.signal(&NegotiationMessage::Offer { sdp });

        Ok(())
    }

    async fn local_sdp(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::SdpError("No local description".to_string()))
    }

    async fn handle_signal(&mut self, payload: SignalPayload) -> Result<()> {
        match NegotiationMessage::from_payload(payload)? {
            NegotiationMessage::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;
                self.set_remote(offer).await?;

                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

                self.pc.set_local_description(answer).await.map_err(|e| {
                    Error::SdpError(format!("Failed to set local description: {}", e))
                })?;

                let sdp = self.local_sdp().await?;
                debug!("Created SDP answer for peer {}", self.emitter.peer_id);
                self.emitter.signal(&NegotiationMessage::Answer { sdp });
            }
            NegotiationMessage::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;
                self.set_remote(answer).await?;

                if std::mem::take(&mut self.renegotiate_pending) {
                    self.offer().await?;
                }
            }
            NegotiationMessage::Candidate { candidate } => {
                if self.pc.remote_description().await.is_none() {
                    self.pending_candidates.push(candidate);
                } else {
                    self.add_candidate(candidate).await?;
                }
            }
            NegotiationMessage::Renegotiate => match self.role {
                Role::Initiator => self.offer().await?,
                Role::Responder => debug!("Ignoring renegotiation request as responder"),
            },
        }

        Ok(())
    }

    async fn set_remote(&mut self, desc: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.add_candidate(candidate).await {
                warn!("Peer {}: {}", self.emitter.peer_id, e);
            }
        }

        Ok(())
    }

    /// A bad candidate only loses that path, see [`Negotiator::fail`]
    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Attach every local track, then renegotiate
    async fn add_stream(&mut self, stream: &MediaStream) -> Result<()> {
        let mut added = 0;

        for track in stream.tracks() {
            if track.is_ended() || self.senders.contains_key(track.id()) {
                continue;
            }

            let outbound = self.add_local_track(&track, stream.id()).await?;
            self.senders.insert(track.id().to_string(), outbound);
            added += 1;
        }

        info!(
            "Attached local stream {} to peer {} ({} tracks)",
            stream.id(),
            self.emitter.peer_id,
            added
        );

        if added == 0 {
            return Ok(());
        }

        match self.role {
            Role::Initiator => self.offer().await,
            Role::Responder => {
                self.emitter.signal(&NegotiationMessage::Renegotiate);
                Ok(())
            }
        }
    }

    async fn add_local_track(&self, track: &MediaTrack, stream_id: &str) -> Result<OutboundTrack> {
        let local = local_sample_track(track, stream_id);

        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add {} track: {}", track.kind(), e))
            })?;

        // RTCP must be drained for the interceptors to work
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        Ok(OutboundTrack::start(track, local, sender))
    }

    async fn replace_track(&mut self, old: Option<String>, new: &MediaTrack) -> Result<()> {
        let key = match old {
            Some(id) if self.senders.contains_key(&id) => Some(id),
            _ => self
                .senders
                .iter()
                .find(|(_, outbound)| outbound.kind == new.kind())
                .map(|(id, _)| id.clone()),
        };

        let Some(key) = key else {
            debug!(
                "No outbound {} sender for peer {}, nothing to replace",
                new.kind(),
                self.emitter.peer_id
            );
            return Ok(());
        };

        let Some(sender) = self.senders.get(&key).map(|o| Arc::clone(&o.sender)) else {
            return Ok(());
        };

        let local = local_sample_track(new, &format!("stream-{}", self.emitter.connection_id));
        sender
            .replace_track(Some(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))?;

        // Dropping the old entry stops its forwarder
        self.senders.remove(&key);
        self.senders
            .insert(new.id().to_string(), OutboundTrack::start(new, local, sender));

        debug!(
            "Replaced outbound {} track for peer {}",
            new.kind(),
            self.emitter.peer_id
        );

        Ok(())
    }

    /// Report a failure; recoverable ones are only logged
    fn fail(&self, error: Error) {
        match error {
            Error::SerializationError(_) | Error::IceCandidateError(_) => {
                warn!("Peer {}: {}", self.emitter.peer_id, error);
            }
            other => {
                warn!("Peer {} transport failure: {}", self.emitter.peer_id, other);
                self.emitter.emit(TransportEventKind::Error(other.to_string()));
            }
        }
    }

    /// Detach every handler, then close the peer connection
    async fn shutdown(self) {
        self.emitter.detached.store(true, Ordering::SeqCst);

        self.pc
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| {
                Box::pin(async {})
            }));
        self.pc.on_track(Box::new(
            |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                Box::pin(async {})
            },
        ));

        if let Err(e) = self.pc.close().await {
            let err = Error::PeerConnectionError(format!("Failed to close: {}", e));
            warn!("Peer {}: {}", self.emitter.peer_id, err);
        }

        info!("Closed peer connection for peer {}", self.emitter.peer_id);
    }
}

/// Outbound RTP sender fed from one local track
struct OutboundTrack {
    kind: TrackKind,
    sender: Arc<RTCRtpSender>,
    forwarder: JoinHandle<()>,
}

impl OutboundTrack {
    fn start(
        track: &MediaTrack,
        local: Arc<TrackLocalStaticSample>,
        sender: Arc<RTCRtpSender>,
    ) -> Self {
        let forwarder = tokio::spawn(forward_samples(track.clone(), track.subscribe(), local));
        Self {
            kind: track.kind(),
            sender,
            forwarder,
        }
    }
}

impl Drop for OutboundTrack {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Copy frames written to `track` onto the RTP track until it ends
async fn forward_samples(
    track: MediaTrack,
    mut samples: broadcast::Receiver<EncodedSample>,
    local: Arc<TrackLocalStaticSample>,
) {
    loop {
        let sample = match samples.recv().await {
            Ok(sample) => sample,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(
                    "Outbound {} track {} skipped {} frames",
                    track.kind(),
                    track.id(),
                    skipped
                );
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if track.is_ended() {
            return;
        }
        // Frames queued before a mute are not sent
        if !track.is_enabled() {
            continue;
        }

        let sample = Sample {
            data: sample.data,
            duration: sample.duration,
            timestamp: std::time::SystemTime::now(),
            ..Default::default()
        };
        if let Err(e) = local.write_sample(&sample).await {
            warn!("Failed to write RTP sample for track {}: {}", track.id(), e);
        }
    }
}

fn local_sample_track(track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    let capability = match track.kind() {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000, // Standard 90kHz clock for video
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    };

    Arc::new(TrackLocalStaticSample::new(
        capability,
        track.id().to_string(),
        stream_id.to_string(),
    ))
}
