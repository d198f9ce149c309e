//! Headless mesh peer
//!
//! Joins a rendezvous service, connects to every other participant and logs
//! roster changes until Ctrl+C or until the rendezvous connection drops.
//!
//! # Usage
//!
//! ```bash
//! # Join a local rendezvous service with camera and microphone
//! cargo run --bin meshcall_peer -- --rendezvous-url ws://localhost:3000
//!
//! # Relay through TURN with shared credentials
//! cargo run --bin meshcall_peer -- \
//!   --ice-server-url turn.example.com:3478 \
//!   --ice-username user --ice-credential secret
//!
//! # Simulate a participant without a camera
//! cargo run --bin meshcall_peer -- --devices mic,screen --media camera-mic
//! ```

use clap::Parser;
use meshcall::{
    GlarePolicy, LoggingSink, MediaSourceManager, MeshConfig, MeshOrchestrator, SourceKind,
    SyntheticDevices, WebRtcConnectionFactory, WebSocketRendezvous,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Headless full-mesh call participant
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Rendezvous WebSocket URL
    #[arg(
        long,
        default_value = "ws://localhost:3000",
        env = "MESHCALL_RENDEZVOUS_URL"
    )]
    rendezvous_url: String,

    /// ICE servers (comma-separated, bare host:port means TURN)
    #[arg(long, default_value = "", env = "MESHCALL_ICE_SERVER_URL")]
    ice_server_url: String,

    /// Username shared by every ICE server
    #[arg(long, env = "MESHCALL_ICE_USERNAME")]
    ice_username: Option<String>,

    /// Credential shared by every ICE server
    #[arg(long, env = "MESHCALL_ICE_CREDENTIAL")]
    ice_credential: Option<String>,

    /// Which side initiates: introduction, peer-id-ordering
    #[arg(long, default_value = "introduction", env = "MESHCALL_GLARE_POLICY")]
    glare_policy: GlarePolicyArg,

    /// Tear down negotiations stalled for this many seconds
    #[arg(long, env = "MESHCALL_NEGOTIATION_TIMEOUT")]
    negotiation_timeout_secs: Option<u64>,

    /// Seconds to wait for the rendezvous welcome
    #[arg(long, default_value_t = 10, env = "MESHCALL_CONNECT_TIMEOUT")]
    connect_timeout_secs: u64,

    /// Maximum roster size (uncapped when omitted)
    #[arg(long, env = "MESHCALL_MAX_PEERS")]
    max_peers: Option<u32>,

    /// Simulated capture devices (comma-separated: camera, mic, screen)
    #[arg(long, default_value = "camera,mic,screen", env = "MESHCALL_DEVICES")]
    devices: String,

    /// Media preference: camera-mic, screen-share, mic-only
    #[arg(long, default_value = "camera-mic", env = "MESHCALL_MEDIA")]
    media: SourceKind,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "MESHCALL_JSON_LOGS")]
    json_logs: bool,
}

/// Glare policy CLI argument wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum GlarePolicyArg {
    Introduction,
    PeerIdOrdering,
}

impl From<GlarePolicyArg> for GlarePolicy {
    fn from(arg: GlarePolicyArg) -> Self {
        match arg {
            GlarePolicyArg::Introduction => GlarePolicy::Introduction,
            GlarePolicyArg::PeerIdOrdering => GlarePolicy::PeerIdOrdering,
        }
    }
}

/// Build MeshConfig from CLI arguments
fn build_config_from_args(args: &Args) -> MeshConfig {
    let mut config = MeshConfig::new(&args.rendezvous_url)
        .with_ice_servers(&args.ice_server_url)
        .with_ice_credentials(
            args.ice_username.as_deref().unwrap_or_default(),
            args.ice_credential.as_deref().unwrap_or_default(),
        )
        .with_glare_policy(args.glare_policy.into());

    if let Some(secs) = args.negotiation_timeout_secs {
        config = config.with_negotiation_timeout(secs);
    }
    if let Some(cap) = args.max_peers {
        config = config.with_max_peers(cap);
    }
    config.connect_timeout_secs = args.connect_timeout_secs;

    config
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = build_config_from_args(&args);
    config.validate()?;

    info!(
        rendezvous_url = %config.rendezvous_url,
        ice_servers = %config.ice_server_urls,
        glare_policy = ?config.glare_policy,
        negotiation_timeout = ?config.negotiation_timeout_secs,
        max_peers = ?config.max_peers,
        devices = %args.devices,
        media = %args.media,
        "Configuration loaded"
    );

    let rendezvous = WebSocketRendezvous::new(&config.rendezvous_url, config.connect_timeout());
    let media = MediaSourceManager::new(Arc::new(SyntheticDevices::from_list(&args.devices)));

    let orchestrator = MeshOrchestrator::new(
        config,
        media,
        Arc::new(rendezvous),
        Arc::new(WebRtcConnectionFactory::new()?),
        Arc::new(LoggingSink),
    )?;
    let handle = orchestrator.handle();
    let event_loop = tokio::spawn(orchestrator.run());

    let local = handle.start_call(args.media).await?;
    info!(
        "Call started: audio={}, video={}",
        local.has_audio(),
        local.has_video()
    );

    info!("Peer running. Press Ctrl+C to leave the call.");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, leaving call...");
        }
        _ = handle.call_ended() => {
            warn!("Call ended by the mesh, exiting");
        }
    }

    for peer in handle.peers().await? {
        info!(
            peer_id = %peer.peer_id,
            state = ?peer.state,
            remote_stream = peer.has_remote_stream,
            "Peer at shutdown"
        );
    }

    if let Err(e) = handle.shutdown().await {
        warn!("Orchestrator already stopped: {}", e);
    }
    event_loop.await?;

    info!("Left call");
    Ok(())
}
