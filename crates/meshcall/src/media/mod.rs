//! Local and remote media handles
//!
//! Stream/track handles, the capture device capability, and the manager
//! that owns the local outbound stream.

pub mod devices;
pub mod manager;
pub mod stream;

pub use devices::{DeviceError, DeviceState, MediaConstraints, MediaDevices, SyntheticDevices};
pub use manager::{LocalMediaState, MediaSourceManager, SourceKind, TrackSwap};
pub use stream::{EncodedSample, MediaStream, MediaTrack, TrackKind};
