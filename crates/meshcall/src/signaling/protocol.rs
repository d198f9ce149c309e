//! Rendezvous wire protocol
//!
//! One JSON object per WebSocket text frame, tagged as
//! `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

/// Client identifier assigned by the rendezvous service
pub type PeerId = String;

/// Opaque negotiation blob relayed between peers
///
/// The channel and the registry never look inside; only the transport at
/// each end interprets it.
pub type SignalPayload = serde_json::Value;

/// Frames exchanged with the rendezvous service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum RendezvousMessage {
    /// First frame after connecting: assigns the local client id
    Welcome {
        /// Assigned client id
        id: PeerId,
    },

    /// Clients already present when we joined
    Introduction(Vec<PeerId>),

    /// A client joined after us
    NewUserConnected(PeerId),

    /// A client left
    UserDisconnected(PeerId),

    /// Negotiation message relayed between two clients
    Signal(SignalEnvelope),
}

/// Addressed negotiation message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    /// Recipient client id
    pub to: PeerId,

    /// Sender client id
    pub from: PeerId,

    /// Opaque negotiation payload
    pub payload: SignalPayload,
}

/// Inbound event delivered to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Clients already present when we joined
    Introduction(Vec<PeerId>),

    /// A client joined after us
    NewUserConnected(PeerId),

    /// A client left
    UserDisconnected(PeerId),

    /// Negotiation message, possibly addressed to someone else
    Signal {
        /// Recipient client id
        to: PeerId,
        /// Sender client id
        from: PeerId,
        /// Opaque negotiation payload
        payload: SignalPayload,
    },

    /// The rendezvous connection is gone
    Disconnected,
}

impl RendezvousMessage {
    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize rendezvous message: {}",
                e
            ))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize rendezvous message: {}",
                e
            ))
        })
    }

    /// Event for the orchestrator, `None` for handshake frames
    pub fn into_event(self) -> Option<SignalingEvent> {
        match self {
            RendezvousMessage::Welcome { .. } => None,
            RendezvousMessage::Introduction(ids) => Some(SignalingEvent::Introduction(ids)),
            RendezvousMessage::NewUserConnected(id) => Some(SignalingEvent::NewUserConnected(id)),
            RendezvousMessage::UserDisconnected(id) => Some(SignalingEvent::UserDisconnected(id)),
            RendezvousMessage::Signal(env) => Some(SignalingEvent::Signal {
                to: env.to,
                from: env.from,
                payload: env.payload,
            }),
        }
    }
}
