//! Local media source lifecycle
//!
//! Owns the outbound stream: acquisition with fallback, track toggling and
//! switching the video source between camera and screen.

use super::devices::{DeviceError, MediaConstraints, MediaDevices};
use super::stream::{MediaStream, MediaTrack};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the local video comes from
///
/// Also used as the user's capture preference when starting a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Camera plus microphone
    CameraMic,
    /// Screen capture, with microphone when available
    ScreenShare,
    /// Microphone only
    MicOnly,
}

impl SourceKind {
    /// Fallback chain tried for this preference, most preferred first
    pub fn fallback_chain(&self) -> &'static [SourceKind] {
        match self {
            SourceKind::CameraMic => &[
                SourceKind::CameraMic,
                SourceKind::ScreenShare,
                SourceKind::MicOnly,
            ],
            SourceKind::ScreenShare => &[SourceKind::ScreenShare, SourceKind::MicOnly],
            SourceKind::MicOnly => &[SourceKind::MicOnly],
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::CameraMic => write!(f, "camera-mic"),
            SourceKind::ScreenShare => write!(f, "screen-share"),
            SourceKind::MicOnly => write!(f, "mic-only"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "camera-mic" | "camera" => Ok(SourceKind::CameraMic),
            "screen-share" | "screen" => Ok(SourceKind::ScreenShare),
            "mic-only" | "mic" => Ok(SourceKind::MicOnly),
            other => Err(Error::InvalidConfig(format!(
                "unknown media preference '{}', expected camera-mic, screen-share or mic-only",
                other
            ))),
        }
    }
}

/// State of the local outbound media
#[derive(Debug, Clone)]
pub struct LocalMediaState {
    /// Outbound stream shared with every session
    pub stream: MediaStream,

    /// Whether outgoing video is enabled
    pub video_enabled: bool,

    /// Whether outgoing audio is enabled
    pub audio_enabled: bool,

    /// Current video source
    pub source_kind: SourceKind,
}

/// Result of replacing the outbound video track
#[derive(Debug, Clone)]
pub struct TrackSwap {
    /// Video track that was stopped and detached (None if there was none)
    pub old: Option<MediaTrack>,

    /// Video track now carried by the local stream
    pub new: MediaTrack,
}

/// Acquires and owns the local outbound stream
pub struct MediaSourceManager {
    /// Capture capability
    devices: Arc<dyn MediaDevices>,

    /// Current local media, None until acquired
    state: Option<LocalMediaState>,
}

impl MediaSourceManager {
    /// Create a manager over the given capture devices
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: None,
        }
    }

    /// Current local media, if acquired
    pub fn state(&self) -> Option<&LocalMediaState> {
        self.state.as_ref()
    }

    /// Local outbound stream, if acquired
    pub fn stream(&self) -> Option<&MediaStream> {
        self.state.as_ref().map(|s| &s.stream)
    }

    /// Acquire local media following the fallback chain for `preference`
    ///
    /// Each step is tried only when the previous one failed. Returns the
    /// existing state unchanged when media is already acquired.
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` when every step of the chain failed.
    pub async fn acquire(&mut self, preference: SourceKind) -> Result<&LocalMediaState> {
        if self.state.is_some() {
            debug!("Local media already acquired, keeping current source");
            return self.state.as_ref().ok_or(Error::CallNotActive);
        }

        let mut failures = Vec::new();

        for &step in preference.fallback_chain() {
            match self.capture(step).await {
                Ok(stream) => {
                    info!(
                        "Acquired local media: source={}, audio={}, video={}",
                        step,
                        stream.has_audio(),
                        stream.has_video()
                    );

                    let state = LocalMediaState {
                        video_enabled: stream.has_video(),
                        audio_enabled: stream.has_audio(),
                        source_kind: step,
                        stream,
                    };
                    return Ok(self.state.insert(state));
                }
                Err(e) => {
                    warn!("Media source {} unavailable: {}", step, e);
                    failures.push(format!("{}: {}", step, e));
                }
            }
        }

        Err(Error::MediaUnavailable(failures.join("; ")))
    }

    /// Capture one step of the fallback chain
    async fn capture(&self, step: SourceKind) -> std::result::Result<MediaStream, DeviceError> {
        match step {
            SourceKind::CameraMic => self.devices.get_user_media(MediaConstraints::CAMERA_MIC).await,
            SourceKind::MicOnly => self.devices.get_user_media(MediaConstraints::MIC).await,
            SourceKind::ScreenShare => {
                let screen = self.devices.get_display_media().await?;

                // Microphone is best effort: a screen without audio still counts
                match self.devices.get_user_media(MediaConstraints::MIC).await {
                    Ok(mic) => {
                        for track in mic.audio_tracks() {
                            screen.add_track(track);
                        }
                    }
                    Err(e) => {
                        warn!("No microphone for screen share, sharing screen only: {}", e);
                    }
                }

                Ok(screen)
            }
        }
    }

    /// Flip the enabled flag of the video track(s)
    ///
    /// Returns the new state, or the current one unchanged when there is no
    /// video track.
    pub fn toggle_video(&mut self) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };

        let tracks = state.stream.video_tracks();
        if tracks.is_empty() {
            return state.video_enabled;
        }

        state.video_enabled = !state.video_enabled;
        for track in &tracks {
            track.set_enabled(state.video_enabled);
        }

        debug!("Local video enabled: {}", state.video_enabled);
        state.video_enabled
    }

    /// Flip the enabled flag of the audio track(s)
    ///
    /// Returns the new state, or the current one unchanged when there is no
    /// audio track.
    pub fn toggle_mic(&mut self) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };

        let tracks = state.stream.audio_tracks();
        if tracks.is_empty() {
            return state.audio_enabled;
        }

        state.audio_enabled = !state.audio_enabled;
        for track in &tracks {
            track.set_enabled(state.audio_enabled);
        }

        debug!("Local audio enabled: {}", state.audio_enabled);
        state.audio_enabled
    }

    /// Enable or disable every outgoing track at once
    pub fn set_outgoing_enabled(&mut self, enabled: bool) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        for track in state.stream.tracks() {
            track.set_enabled(enabled);
        }
        state.video_enabled = enabled && state.stream.has_video();
        state.audio_enabled = enabled && state.stream.has_audio();

        debug!("Outgoing media enabled: {}", enabled);
    }

    /// Replace the video source with a screen capture
    ///
    /// Returns `None` when the screen is already the source.
    pub async fn switch_to_screen_share(&mut self) -> Result<Option<TrackSwap>> {
        self.switch_video(SourceKind::ScreenShare).await
    }

    /// Replace the video source with the camera
    ///
    /// Returns `None` when the camera is already the source.
    pub async fn switch_to_camera(&mut self) -> Result<Option<TrackSwap>> {
        self.switch_video(SourceKind::CameraMic).await
    }

    async fn switch_video(&mut self, target: SourceKind) -> Result<Option<TrackSwap>> {
        let current = self
            .state
            .as_ref()
            .map(|s| s.source_kind)
            .ok_or_else(|| Error::MediaTrackError("No local media acquired".to_string()))?;

        if current == target {
            debug!("Video source already {}", target);
            return Ok(None);
        }

        // Acquire first; the previous source stays live if this fails
        let captured = match target {
            SourceKind::ScreenShare => self.devices.get_display_media().await,
            _ => self.devices.get_user_media(MediaConstraints::CAMERA).await,
        }
        .map_err(|e| Error::MediaTrackError(format!("Failed to switch to {}: {}", target, e)))?;

        let mut video = captured.video_tracks().into_iter();
        let new_track = video.next().ok_or_else(|| {
            Error::MediaTrackError(format!("{} capture returned no video track", target))
        })?;
        for extra in video.chain(captured.audio_tracks()) {
            extra.stop();
        }

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::MediaTrackError("No local media acquired".to_string()))?;

        let previous = state.stream.video_tracks();
        let had_video = !previous.is_empty();
        for track in &previous {
            track.stop();
            state.stream.remove_track(track.id());
        }

        if had_video {
            new_track.set_enabled(state.video_enabled);
        } else {
            state.video_enabled = true;
        }
        state.stream.add_track(new_track.clone());
        state.source_kind = target;

        info!("Switched local video source {} -> {}", current, target);

        Ok(Some(TrackSwap {
            old: previous.into_iter().next(),
            new: new_track,
        }))
    }

    /// Stop every local track and forget the stream
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            info!("Releasing local media ({})", state.source_kind);
            state.stream.stop_all();
        }
    }
}

impl Drop for MediaSourceManager {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::devices::{DeviceState, SyntheticDevices};

    fn manager(devices: SyntheticDevices) -> MediaSourceManager {
        MediaSourceManager::new(Arc::new(devices))
    }

    #[tokio::test]
    async fn test_camera_mic_preferred() {
        let mut media = manager(SyntheticDevices::new());
        let state = media.acquire(SourceKind::CameraMic).await.unwrap();

        assert_eq!(state.source_kind, SourceKind::CameraMic);
        assert!(state.video_enabled);
        assert!(state.audio_enabled);
    }

    #[tokio::test]
    async fn test_screen_fallback_without_microphone() {
        let mut media = manager(
            SyntheticDevices::new()
                .with_camera(DeviceState::Denied)
                .with_microphone(DeviceState::Denied),
        );

        let state = media.acquire(SourceKind::CameraMic).await.unwrap();
        assert_eq!(state.source_kind, SourceKind::ScreenShare);
        assert!(!state.stream.has_audio());
        assert!(state.stream.has_video());
        assert!(!state.audio_enabled);
    }

    #[tokio::test]
    async fn test_screen_fallback_picks_up_microphone() {
        let mut media = manager(SyntheticDevices::new().with_camera(DeviceState::Missing));

        let state = media.acquire(SourceKind::CameraMic).await.unwrap();
        assert_eq!(state.source_kind, SourceKind::ScreenShare);
        assert!(state.stream.has_audio());
    }

    #[tokio::test]
    async fn test_mic_only_fallback() {
        let mut media = manager(
            SyntheticDevices::new()
                .with_camera(DeviceState::Missing)
                .with_screen(DeviceState::Denied),
        );

        let state = media.acquire(SourceKind::CameraMic).await.unwrap();
        assert_eq!(state.source_kind, SourceKind::MicOnly);
        assert!(!state.video_enabled);
    }

    #[tokio::test]
    async fn test_all_sources_fail() {
        let mut media = manager(SyntheticDevices::from_list(""));

        let err = media.acquire(SourceKind::CameraMic).await.unwrap_err();
        assert!(matches!(err, Error::MediaUnavailable(_)));
        assert!(media.state().is_none());
    }

    #[tokio::test]
    async fn test_preference_skips_earlier_steps() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut media = MediaSourceManager::new(devices.clone());

        let state = media.acquire(SourceKind::MicOnly).await.unwrap();
        assert_eq!(state.source_kind, SourceKind::MicOnly);
        assert_eq!(devices.display_media_requests(), 0);
    }

    #[tokio::test]
    async fn test_toggle_video_twice_restores_state() {
        let mut media = manager(SyntheticDevices::new());
        media.acquire(SourceKind::CameraMic).await.unwrap();

        assert!(!media.toggle_video());
        let track = media.stream().unwrap().video_tracks()[0].clone();
        assert!(!track.is_enabled());

        assert!(media.toggle_video());
        assert!(track.is_enabled());
    }

    #[tokio::test]
    async fn test_toggle_without_track_is_noop() {
        let mut media = manager(SyntheticDevices::from_list("mic"));
        media.acquire(SourceKind::CameraMic).await.unwrap();

        assert!(!media.toggle_video());
        assert!(!media.toggle_video());
        assert!(!media.toggle_mic());
        assert!(media.toggle_mic());
    }

    #[tokio::test]
    async fn test_switch_to_screen_keeps_audio() {
        let mut media = manager(SyntheticDevices::new());
        media.acquire(SourceKind::CameraMic).await.unwrap();
        let stream = media.stream().unwrap().clone();
        let mic = stream.audio_tracks()[0].clone();
        let camera = stream.video_tracks()[0].clone();

        let swap = media.switch_to_screen_share().await.unwrap().unwrap();

        assert_eq!(swap.old.as_ref(), Some(&camera));
        assert!(camera.is_ended());
        assert_eq!(stream.video_tracks(), vec![swap.new.clone()]);
        assert_eq!(stream.audio_tracks(), vec![mic.clone()]);
        assert!(!mic.is_ended());
        assert_eq!(media.state().unwrap().source_kind, SourceKind::ScreenShare);

        // Already sharing the screen
        assert!(media.switch_to_screen_share().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_previous_source() {
        let mut media = manager(SyntheticDevices::new().with_screen(DeviceState::Denied));
        media.acquire(SourceKind::CameraMic).await.unwrap();
        let camera = media.stream().unwrap().video_tracks()[0].clone();

        let err = media.switch_to_screen_share().await.unwrap_err();
        assert!(matches!(err, Error::MediaTrackError(_)));
        assert!(!camera.is_ended());
        assert_eq!(media.state().unwrap().source_kind, SourceKind::CameraMic);
    }

    #[tokio::test]
    async fn test_switch_preserves_disabled_video() {
        let mut media = manager(SyntheticDevices::new());
        media.acquire(SourceKind::CameraMic).await.unwrap();
        media.toggle_video();

        let swap = media.switch_to_screen_share().await.unwrap().unwrap();
        assert!(!swap.new.is_enabled());

        let swap = media.switch_to_camera().await.unwrap().unwrap();
        assert!(!swap.new.is_enabled());
        assert_eq!(media.state().unwrap().source_kind, SourceKind::CameraMic);
    }

    #[tokio::test]
    async fn test_set_outgoing_enabled() {
        let mut media = manager(SyntheticDevices::new());
        media.acquire(SourceKind::CameraMic).await.unwrap();

        media.set_outgoing_enabled(false);
        let state = media.state().unwrap();
        assert!(!state.video_enabled && !state.audio_enabled);
        assert!(state.stream.tracks().iter().all(|t| !t.is_enabled()));

        media.set_outgoing_enabled(true);
        assert!(media.state().unwrap().stream.tracks().iter().all(MediaTrack::is_enabled));
    }

    #[tokio::test]
    async fn test_release_stops_tracks() {
        let mut media = manager(SyntheticDevices::new());
        media.acquire(SourceKind::CameraMic).await.unwrap();
        let stream = media.stream().unwrap().clone();

        media.release();
        assert!(media.state().is_none());
        assert!(stream.tracks().iter().all(MediaTrack::is_ended));
    }

    #[test]
    fn test_source_kind_parsing() {
        assert_eq!("screen".parse::<SourceKind>().unwrap(), SourceKind::ScreenShare);
        assert_eq!("mic-only".parse::<SourceKind>().unwrap(), SourceKind::MicOnly);
        assert!("hologram".parse::<SourceKind>().is_err());
    }
}
