//! Full-mesh peer-to-peer call orchestration
//!
//! Every participant keeps one direct WebRTC connection to every other
//! participant. This crate discovers peers through a rendezvous service,
//! negotiates a connection with each of them, routes negotiation messages
//! to the right connection and keeps the local and remote streams in step
//! with the changing roster.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Presentation layer (UI, headless bot, ...)              │
//! │  ↑ PresentationSink              ↓ OrchestratorHandle    │
//! │  MeshOrchestrator (single FIFO event loop)               │
//! │  ├─ MediaSourceManager (capture, fallback, toggles)      │
//! │  ├─ SignalingChannel (WebSocket rendezvous)              │
//! │  └─ PeerRegistry (roster, per-peer state machine)        │
//! │      └─ ConnectionHandle per peer (webrtc-rs task)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meshcall::{resolve_ice_servers, MeshConfig};
//!
//! let config = MeshConfig::new("ws://localhost:3000")
//!     .with_ice_servers("turn.example.com:3478")
//!     .with_ice_credentials("user", "secret");
//! assert!(config.validate().is_ok());
//!
//! let servers = resolve_ice_servers(
//!     &config.ice_server_urls,
//!     config.ice_username.as_deref(),
//!     config.ice_credential.as_deref(),
//! );
//! assert_eq!(servers[0].urls, vec!["turn:turn.example.com:3478".to_string()]);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use meshcall::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> meshcall::Result<()> {
//! let config = MeshConfig::new("ws://localhost:3000");
//! let rendezvous = WebSocketRendezvous::new(&config.rendezvous_url, config.connect_timeout());
//!
//! let orchestrator = MeshOrchestrator::new(
//!     config,
//!     MediaSourceManager::new(Arc::new(SyntheticDevices::new())),
//!     Arc::new(rendezvous),
//!     Arc::new(WebRtcConnectionFactory::new()?),
//!     Arc::new(LoggingSink),
//! )?;
//! let handle = orchestrator.handle();
//! tokio::spawn(orchestrator.run());
//!
//! handle.start_call(SourceKind::CameraMic).await?;
//! handle.toggle_mic().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ice;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod presentation;
pub mod signaling;
pub mod transport;

pub use config::{GlarePolicy, MeshConfig};
pub use error::{Error, Result};
pub use ice::{resolve_ice_servers, IceServer, FALLBACK_STUN_URL};
pub use media::{
    DeviceError, DeviceState, EncodedSample, LocalMediaState, MediaConstraints, MediaDevices,
    MediaSourceManager, MediaStream, MediaTrack, SourceKind, SyntheticDevices, TrackKind,
};
pub use orchestrator::{CallCommand, MeshInput, MeshOrchestrator, OrchestratorHandle};
pub use peer::{PeerInfo, PeerRegistry, SessionState};
pub use presentation::{ChannelSink, LoggingSink, MeshEvent, PresentationSink};
pub use signaling::{
    PeerId, Rendezvous, SignalPayload, SignalSender, SignalingChannel, SignalingEvent,
    WebSocketRendezvous,
};
pub use transport::{
    ConnectionFactory, ConnectionHandle, ConnectionId, Role, TransportEvent, TransportEventKind,
    WebRtcConnectionFactory,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
