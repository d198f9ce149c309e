//! ICE server resolution
//!
//! Turns the raw comma-separated server list from configuration into the
//! ordered descriptor list handed to every new peer connection.

use serde::{Deserialize, Serialize};

/// Public STUN server appended when no relay is configured
pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Scheme prefixed to bare `host:port` entries
pub const DEFAULT_SCHEME: &str = "turn:";

const KNOWN_SCHEMES: [&str; 3] = ["stun:", "turn:", "turns:"];

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Endpoint URIs, in configuration order
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Descriptor for a single URL without credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Whether any of the URLs is a TURN relay (`turn:` or `turns:`)
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

/// Resolve the configured ICE servers
///
/// # Arguments
///
/// * `raw` - Comma-separated server list, possibly empty
/// * `username` - Shared username, ignored when empty
/// * `credential` - Shared credential, ignored when empty
///
/// Entries are trimmed, empty entries dropped, and bare entries prefixed
/// with `turn:`. Malformed URLs pass through untouched; the transport
/// rejects them later. When no relay ends up in the list, the public STUN
/// server is appended so direct paths can still be discovered.
pub fn resolve_ice_servers(
    raw: &str,
    username: Option<&str>,
    credential: Option<&str>,
) -> Vec<IceServer> {
    let username = username.filter(|u| !u.is_empty());
    let credential = credential.filter(|c| !c.is_empty());

    let mut servers: Vec<IceServer> = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| IceServer {
            urls: vec![with_scheme(entry)],
            username: username.map(str::to_string),
            credential: credential.map(str::to_string),
        })
        .collect();

    if !servers.iter().any(IceServer::is_relay) {
        servers.push(IceServer::new(FALLBACK_STUN_URL));
    }

    servers
}

fn with_scheme(entry: &str) -> String {
    if KNOWN_SCHEMES.iter().any(|scheme| entry.starts_with(scheme)) {
        entry.to_string()
    } else {
        format!("{}{}", DEFAULT_SCHEME, entry)
    }
}
