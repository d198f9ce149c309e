//! Rendezvous signaling
//!
//! Thin, event-addressable connection to the rendezvous service. Payloads
//! are relayed untouched.

pub mod client;
pub mod protocol;

pub use client::{Rendezvous, SignalSender, SignalingChannel, WebSocketRendezvous};
pub use protocol::{PeerId, RendezvousMessage, SignalEnvelope, SignalPayload, SignalingEvent};
