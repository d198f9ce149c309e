//! Error types for the peer mesh orchestrator

/// Result type alias using the mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a mesh call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No media source in the fallback chain could be acquired
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Local track could not be acquired or replaced
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Rendezvous channel error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Operation requires an active call
    #[error("No active call")]
    CallNotActive,

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// The orchestrator event loop is gone
    #[error("Orchestrator stopped")]
    OrchestratorStopped,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::Timeout(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    ///
    /// Peer errors are isolated to a single session and never end the call.
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
        )
    }
}
