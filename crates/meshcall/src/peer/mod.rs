//! Peer sessions and the roster that owns them

pub mod registry;
pub mod session;

pub use registry::{PeerInfo, PeerRegistry};
pub use session::{PeerSession, SessionState};
