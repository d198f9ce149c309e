//! Capture device capability
//!
//! Capture itself happens outside this crate. Implementations of
//! [`MediaDevices`] hand back track handles for whatever capture stack the
//! host uses; [`SyntheticDevices`] stands in when there is none.

use super::stream::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Which kinds of track a capture request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Request an audio track
    pub audio: bool,
    /// Request a video track
    pub video: bool,
}

impl MediaConstraints {
    /// Camera and microphone
    pub const CAMERA_MIC: Self = Self {
        audio: true,
        video: true,
    };

    /// Camera only
    pub const CAMERA: Self = Self {
        audio: false,
        video: true,
    };

    /// Microphone only
    pub const MIC: Self = Self {
        audio: true,
        video: false,
    };
}

/// Capture failure reported by a device
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The user or platform refused access
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No such device is present
    #[error("device not found: {0}")]
    NotFound(String),

    /// Any other capture failure
    #[error("capture failed: {0}")]
    Other(String),
}

/// Capture capability consumed by the media source manager
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture from camera and/or microphone
    async fn get_user_media(&self, constraints: MediaConstraints)
        -> Result<MediaStream, DeviceError>;

    /// Capture the screen (video only)
    async fn get_display_media(&self) -> Result<MediaStream, DeviceError>;
}

/// Availability of one synthetic device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Device present and access granted
    Available,
    /// Device absent
    Missing,
    /// Device present, access refused
    Denied,
}

impl DeviceState {
    fn check(self, name: &str) -> Result<(), DeviceError> {
        match self {
            DeviceState::Available => Ok(()),
            DeviceState::Missing => Err(DeviceError::NotFound(name.to_string())),
            DeviceState::Denied => Err(DeviceError::PermissionDenied(name.to_string())),
        }
    }
}

/// Device set producing placeholder tracks
///
/// Used by the `meshcall_peer` binary when no capture stack is wired in,
/// and by tests to script permission failures.
#[derive(Debug)]
pub struct SyntheticDevices {
    camera: DeviceState,
    microphone: DeviceState,
    screen: DeviceState,
    user_media_requests: AtomicUsize,
    display_media_requests: AtomicUsize,
}

impl SyntheticDevices {
    /// All devices available
    pub fn new() -> Self {
        Self {
            camera: DeviceState::Available,
            microphone: DeviceState::Available,
            screen: DeviceState::Available,
            user_media_requests: AtomicUsize::new(0),
            display_media_requests: AtomicUsize::new(0),
        }
    }

    /// Build from a comma-separated device list (`camera,mic,screen`)
    ///
    /// Devices not named are missing. Unknown names are ignored.
    pub fn from_list(list: &str) -> Self {
        let names: Vec<&str> = list.split(',').map(str::trim).collect();
        let state = |aliases: &[&str]| {
            if names.iter().any(|n| aliases.contains(n)) {
                DeviceState::Available
            } else {
                DeviceState::Missing
            }
        };

        Self {
            camera: state(&["camera", "cam", "video"]),
            microphone: state(&["mic", "microphone", "audio"]),
            screen: state(&["screen", "display"]),
            ..Self::new()
        }
    }

    /// Set camera availability
    pub fn with_camera(mut self, state: DeviceState) -> Self {
        self.camera = state;
        self
    }

    /// Set microphone availability
    pub fn with_microphone(mut self, state: DeviceState) -> Self {
        self.microphone = state;
        self
    }

    /// Set screen capture availability
    pub fn with_screen(mut self, state: DeviceState) -> Self {
        self.screen = state;
        self
    }

    /// Number of camera/microphone capture requests served so far
    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    /// Number of screen capture requests served so far
    pub fn display_media_requests(&self) -> usize {
        self.display_media_requests.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, DeviceError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);

        if !constraints.audio && !constraints.video {
            return Err(DeviceError::Other("no track requested".to_string()));
        }

        // Both devices are checked before any track exists, like a browser
        // failing the whole request on one refusal.
        if constraints.video {
            self.camera.check("camera")?;
        }
        if constraints.audio {
            self.microphone.check("microphone")?;
        }

        let stream = MediaStream::new();
        if constraints.video {
            stream.add_track(MediaTrack::new(TrackKind::Video, "synthetic camera"));
        }
        if constraints.audio {
            stream.add_track(MediaTrack::new(TrackKind::Audio, "synthetic microphone"));
        }

        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<MediaStream, DeviceError> {
        self.display_media_requests.fetch_add(1, Ordering::SeqCst);
        self.screen.check("screen")?;

        Ok(MediaStream::with_tracks(vec![MediaTrack::new(
            TrackKind::Video,
            "synthetic screen",
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_camera_mic() {
        let devices = SyntheticDevices::new();
        let stream = devices
            .get_user_media(MediaConstraints::CAMERA_MIC)
            .await
            .unwrap();

        assert!(stream.has_audio());
        assert!(stream.has_video());
        assert_eq!(devices.user_media_requests(), 1);
    }

    #[tokio::test]
    async fn test_denied_device_fails_whole_request() {
        let devices = SyntheticDevices::new().with_microphone(DeviceState::Denied);
        let err = devices
            .get_user_media(MediaConstraints::CAMERA_MIC)
            .await
            .unwrap_err();

        assert_eq!(err, DeviceError::PermissionDenied("microphone".to_string()));

        // Camera alone still works
        assert!(devices.get_user_media(MediaConstraints::CAMERA).await.is_ok());
    }

    #[tokio::test]
    async fn test_from_list() {
        let devices = SyntheticDevices::from_list("screen, mic");

        assert!(devices.get_user_media(MediaConstraints::CAMERA).await.is_err());
        assert!(devices.get_user_media(MediaConstraints::MIC).await.is_ok());

        let screen = devices.get_display_media().await.unwrap();
        assert!(screen.has_video());
        assert!(!screen.has_audio());
        assert_eq!(devices.display_media_requests(), 1);
    }
}
