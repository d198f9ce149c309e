//! Media stream and track handles
//!
//! Handles are cheap to clone and share state: a track disabled through one
//! clone is disabled for every holder, which is how the local stream is
//! shared by all outbound sessions while staying owned by the
//! [`MediaSourceManager`](super::MediaSourceManager).
//!
//! Capture sources push encoded frames into a local track with
//! [`MediaTrack::write_sample`]. Every connection the track is attached to
//! holds a subscription and forwards the frames to its RTP sender.

use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use webrtc::track::track_remote::TrackRemote;

/// Frames buffered per subscriber before the slowest one starts skipping
const SAMPLE_BUFFER: usize = 64;

/// One encoded frame (Opus packet or VP8 frame)
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Encoded payload
    pub data: Bytes,
    /// Playout duration of the frame
    pub duration: Duration,
}

impl EncodedSample {
    /// Create a sample
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    remote: Option<Arc<TrackRemote>>,
    samples: broadcast::Sender<EncodedSample>,
}

/// A single audio or video track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a new live, enabled track
    ///
    /// # Arguments
    ///
    /// * `kind` - Audio or video
    /// * `label` - Human readable source name (device label)
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::build(uuid::Uuid::new_v4().to_string(), kind, label.into(), None)
    }

    /// Wrap an inbound RTP track reported by the transport
    pub fn from_remote(id: String, kind: TrackKind, remote: Arc<TrackRemote>) -> Self {
        Self::build(id, kind, "remote".to_string(), Some(remote))
    }

    fn build(id: String, kind: TrackKind, label: String, remote: Option<Arc<TrackRemote>>) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_BUFFER);
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label,
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                remote,
                samples,
            }),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Source label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the track currently carries media
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track in place
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track and release its source
    pub fn stop(&self) {
        self.inner.ended.store(true, Ordering::SeqCst);
    }

    /// Whether the track has been stopped
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Underlying RTP track for inbound media, if any
    pub fn remote(&self) -> Option<&Arc<TrackRemote>> {
        self.inner.remote.as_ref()
    }

    /// Push an encoded frame to every attached connection
    ///
    /// Frames are dropped while the track is disabled or ended. Returns the
    /// number of subscribers that received the frame.
    pub fn write_sample(&self, sample: EncodedSample) -> usize {
        if !self.is_enabled() || self.is_ended() {
            return 0;
        }
        self.inner.samples.send(sample).unwrap_or(0)
    }

    /// Subscribe to frames written after this call
    pub fn subscribe(&self) -> broadcast::Receiver<EncodedSample> {
        self.inner.samples.subscribe()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.samples.receiver_count()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// An ordered set of tracks sharing one identity
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl MediaStream {
    /// Create an empty stream with a random id
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Create an empty stream with a fixed id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a stream from existing tracks
    pub fn with_tracks(tracks: Vec<MediaTrack>) -> Self {
        let stream = Self::new();
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of all tracks
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.read().clone()
    }

    /// Snapshot of the audio tracks
    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    /// Snapshot of the video tracks
    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// Whether the stream carries at least one audio track
    pub fn has_audio(&self) -> bool {
        self.tracks.read().iter().any(|t| t.kind() == TrackKind::Audio)
    }

    /// Whether the stream carries at least one video track
    pub fn has_video(&self) -> bool {
        self.tracks.read().iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Add a track; a track already present is not added twice
    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.tracks.write();
        if !tracks.contains(&track) {
            tracks.push(track);
        }
    }

    /// Remove a track by id
    pub fn remove_track(&self, track_id: &str) -> Option<MediaTrack> {
        let mut tracks = self.tracks.write();
        let index = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(index))
    }

    /// Stop every track in the stream
    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }

    /// Whether two handles refer to the same stream
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &*self.tracks.read())
            .finish()
    }
}
