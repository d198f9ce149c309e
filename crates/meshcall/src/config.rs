//! Configuration types for the mesh orchestrator

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a mesh call
///
/// Resolved once at startup. Nothing here is hot-reloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Rendezvous WebSocket URL (ws:// or wss://)
    pub rendezvous_url: String,

    /// Raw comma-separated ICE server list (may be empty)
    ///
    /// Bare `host:port` entries are treated as TURN servers.
    pub ice_server_urls: String,

    /// Shared ICE username, attached to every configured server
    pub ice_username: Option<String>,

    /// Shared ICE credential, attached to every configured server
    pub ice_credential: Option<String>,

    /// Which side initiates when both peers could (default: Introduction)
    pub glare_policy: GlarePolicy,

    /// Tear down sessions still negotiating after this many seconds
    ///
    /// `None` (default) keeps stalled sessions indefinitely.
    pub negotiation_timeout_secs: Option<u64>,

    /// How long to wait for the rendezvous `welcome` frame (default: 10)
    pub connect_timeout_secs: u64,

    /// Maximum number of roster entries
    ///
    /// `None` (default) leaves the roster uncapped.
    pub max_peers: Option<u32>,
}

/// Glare resolution strategy
///
/// Decides which of two peers creates the initiator session when both
/// learn about each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlarePolicy {
    /// Peers listed in `introduction` are initiated; peers announced through
    /// `newUserConnected` are waited for.
    Introduction,
    /// The peer with the lexicographically smaller id initiates, regardless
    /// of how the other peer was learned.
    PeerIdOrdering,
}

impl GlarePolicy {
    /// Whether the local side should initiate towards `remote_id`
    ///
    /// `introduced` is true when the remote peer came from an
    /// `introduction` event, false for `newUserConnected`.
    pub fn should_initiate(&self, self_id: &str, remote_id: &str, introduced: bool) -> bool {
        match self {
            GlarePolicy::Introduction => introduced,
            GlarePolicy::PeerIdOrdering => self_id < remote_id,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            rendezvous_url: "ws://localhost:3000".to_string(),
            ice_server_urls: String::new(),
            ice_username: None,
            ice_credential: None,
            glare_policy: GlarePolicy::Introduction,
            negotiation_timeout_secs: None,
            connect_timeout_secs: 10,
            max_peers: None,
        }
    }
}

impl MeshConfig {
    /// Create a configuration pointing at the given rendezvous service
    pub fn new(rendezvous_url: &str) -> Self {
        Self {
            rendezvous_url: rendezvous_url.to_string(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `rendezvous_url` is not a WebSocket URL
    /// - `max_peers` is `Some(0)`
    /// - `connect_timeout_secs` is zero
    /// - `negotiation_timeout_secs` is `Some(0)`
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.rendezvous_url.starts_with("ws://") && !self.rendezvous_url.starts_with("wss://")
        {
            return Err(Error::InvalidConfig(format!(
                "rendezvous_url must start with ws:// or wss://, got {}",
                self.rendezvous_url
            )));
        }

        if self.max_peers == Some(0) {
            return Err(Error::InvalidConfig(
                "max_peers must be at least 1".to_string(),
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.negotiation_timeout_secs == Some(0) {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_secs must be at least 1 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Rendezvous handshake timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Negotiation deadline, if stalled sessions should expire
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_secs.map(Duration::from_secs)
    }

    /// Set the raw ICE server list
    pub fn with_ice_servers(mut self, ice_server_urls: &str) -> Self {
        self.ice_server_urls = ice_server_urls.to_string();
        self
    }

    /// Set the shared ICE username and credential
    ///
    /// Empty strings are treated as unset.
    pub fn with_ice_credentials(mut self, username: &str, credential: &str) -> Self {
        self.ice_username = Some(username.to_string()).filter(|s| !s.is_empty());
        self.ice_credential = Some(credential.to_string()).filter(|s| !s.is_empty());
        self
    }

    /// Set the glare resolution strategy
    pub fn with_glare_policy(mut self, policy: GlarePolicy) -> Self {
        self.glare_policy = policy;
        self
    }

    /// Expire sessions that stay in negotiation longer than `secs`
    pub fn with_negotiation_timeout(mut self, secs: u64) -> Self {
        self.negotiation_timeout_secs = Some(secs);
        self
    }

    /// Cap the roster at `max_peers` entries
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.max_peers = Some(max_peers);
        self
    }
}
