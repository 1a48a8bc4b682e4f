//! Local capture state.
//!
//! [`MediaSource`] is the only writer of track state. Connections receive
//! [`LocalTrack`] handles that share the underlying track; they read the
//! enabled flag but never flip it.

use crate::error::{Result, RtcError};
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Parses the media token of an SDP `m=` line.
    pub fn from_media(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Shared handle to a local capture track. Clones refer to the same track.
#[derive(Debug, Clone)]
pub struct LocalTrack(Arc<TrackInner>);

impl LocalTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self(Arc::new(TrackInner {
            id: format!("{}-{}", kind, random_id()),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn kind(&self) -> TrackKind {
        self.0.kind
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.stopped.load(Ordering::Acquire)
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.0.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        self.0.stopped.store(true, Ordering::Release);
    }
}

/// The local capture stream: at most one audio and one video track.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalStream {
    fn new() -> Self {
        Self {
            id: format!("stream-{}", random_id()),
            audio: None,
            video: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Keeps the first track of each kind and stops the surplus.
    fn absorb(&mut self, tracks: Vec<LocalTrack>) {
        for track in tracks {
            let slot = match track.kind() {
                TrackKind::Audio => &mut self.audio,
                TrackKind::Video => &mut self.video,
            };
            if slot.is_none() {
                *slot = Some(track);
            } else {
                debug!(track = track.id(), "dropping surplus capture track");
                track.stop();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub device_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Capture-device capability surface provided by the host platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Opens capture tracks; refusal is reported as `MediaUnavailable`.
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<Vec<LocalTrack>>;
}

pub struct MediaSource {
    devices: Arc<dyn MediaDevices>,
    stream: Option<LocalStream>,
}

impl MediaSource {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: None,
        }
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.stream.as_ref().map(LocalStream::tracks).unwrap_or_default()
    }

    /// Opens the local stream once; later calls return the stored stream.
    ///
    /// Video is requested only when a camera is present, and a refused
    /// audio+video request falls back to audio only.
    pub async fn acquire(&mut self) -> Result<&LocalStream> {
        if self.stream.is_none() {
            let stream = self.open_stream().await?;
            self.stream = Some(stream);
        }
        self.stream
            .as_ref()
            .ok_or_else(|| RtcError::InvalidState("local stream missing after acquire".into()))
    }

    async fn open_stream(&self) -> Result<LocalStream> {
        let has_camera = match self.devices.enumerate().await {
            Ok(devices) => devices.iter().any(|d| d.kind == DeviceKind::VideoInput),
            Err(e) => {
                warn!(error = %e, "device enumeration failed, requesting audio only");
                false
            }
        };

        let wanted = MediaConstraints {
            audio: true,
            video: has_camera,
        };
        let tracks = match self.devices.get_user_media(wanted).await {
            Ok(tracks) => tracks,
            Err(e) if has_camera => {
                warn!(error = %e, "audio+video capture refused, falling back to audio only");
                self.devices
                    .get_user_media(MediaConstraints {
                        audio: true,
                        video: false,
                    })
                    .await?
            }
            Err(e) => return Err(e),
        };

        let mut stream = LocalStream::new();
        stream.absorb(tracks);
        info!(
            stream = stream.id(),
            audio = stream.audio.is_some(),
            video = stream.video.is_some(),
            "local media acquired"
        );
        Ok(stream)
    }

    /// Flips the audio track's enabled flag. Returns false when there is no
    /// audio track.
    pub fn set_mic_enabled(&mut self, enabled: bool) -> bool {
        match self.stream.as_ref().and_then(LocalStream::audio_track) {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(enabled, "microphone toggled");
                true
            }
            None => false,
        }
    }

    /// Enables or disables the camera.
    ///
    /// Enabling without a video track performs a video-only acquisition and
    /// returns the new track so it can be pushed to every connection.
    /// Disabling keeps the track alive with `enabled = false`.
    pub async fn set_camera_enabled(&mut self, enabled: bool) -> Result<Option<LocalTrack>> {
        if let Some(track) = self.stream.as_ref().and_then(LocalStream::video_track) {
            track.set_enabled(enabled);
            debug!(enabled, "camera toggled");
            return Ok(None);
        }
        if !enabled {
            return Ok(None);
        }

        let tracks = self
            .devices
            .get_user_media(MediaConstraints {
                audio: false,
                video: true,
            })
            .await
            .map_err(|e| match e {
                RtcError::MediaUnavailable(_) => e,
                other => RtcError::MediaUnavailable(other.to_string()),
            })?;

        let mut video = None;
        for track in tracks {
            if track.kind() == TrackKind::Video && video.is_none() {
                video = Some(track);
            } else {
                track.stop();
            }
        }
        let Some(track) = video else {
            return Err(RtcError::MediaUnavailable("no video track returned".into()));
        };

        let stream = self.stream.get_or_insert_with(LocalStream::new);
        stream.video = Some(track.clone());
        info!(track = track.id(), stream = stream.id(), "camera acquired");
        Ok(Some(track))
    }

    /// Stops every track and forgets the stream.
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            for track in stream.tracks() {
                track.stop();
            }
            info!(stream = stream.id(), "local media released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMediaDevices;

    #[tokio::test]
    async fn acquire_is_idempotent() {
        let devices = Arc::new(MockMediaDevices::new(true));
        let mut media = MediaSource::new(devices.clone());

        let first = media.acquire().await.unwrap().id().to_string();
        let second = media.acquire().await.unwrap().id().to_string();

        assert_eq!(first, second);
        assert_eq!(devices.acquisitions(), 1);
        assert_eq!(media.tracks().len(), 2);
    }

    #[tokio::test]
    async fn no_camera_means_audio_only_request() {
        let devices = Arc::new(MockMediaDevices::new(false));
        let mut media = MediaSource::new(devices.clone());

        let stream = media.acquire().await.unwrap();
        assert!(stream.audio_track().is_some());
        assert!(stream.video_track().is_none());
        assert_eq!(devices.requests()[0], MediaConstraints { audio: true, video: false });
    }

    #[tokio::test]
    async fn refused_video_falls_back_to_audio() {
        let devices = Arc::new(MockMediaDevices::new(true));
        devices.refuse_video(true);
        let mut media = MediaSource::new(devices.clone());

        let stream = media.acquire().await.unwrap();
        assert!(stream.audio_track().is_some());
        assert!(stream.video_track().is_none());
        assert_eq!(devices.requests().len(), 2);
    }

    #[tokio::test]
    async fn disabling_camera_keeps_the_track() {
        let devices = Arc::new(MockMediaDevices::new(true));
        let mut media = MediaSource::new(devices.clone());
        media.acquire().await.unwrap();

        assert!(media.set_camera_enabled(false).await.unwrap().is_none());
        let video = media.stream().unwrap().video_track().unwrap().clone();
        assert!(!video.is_enabled());
        assert!(!video.is_stopped());

        assert!(media.set_camera_enabled(true).await.unwrap().is_none());
        assert!(video.is_enabled());
        assert_eq!(devices.acquisitions(), 1);
    }

    #[tokio::test]
    async fn enabling_camera_from_none_acquires_once() {
        let devices = Arc::new(MockMediaDevices::new(false));
        let mut media = MediaSource::new(devices.clone());
        media.acquire().await.unwrap();
        let stream_id = media.stream().unwrap().id().to_string();

        devices.set_camera(true);
        let track = media.set_camera_enabled(true).await.unwrap().unwrap();
        assert_eq!(track.kind(), TrackKind::Video);
        assert_eq!(media.stream().unwrap().id(), stream_id);
        assert_eq!(media.tracks().len(), 2);

        // a second enable reuses the track
        assert!(media.set_camera_enabled(true).await.unwrap().is_none());
        assert_eq!(devices.acquisitions(), 2);
    }

    #[tokio::test]
    async fn refused_camera_leaves_state_unchanged() {
        let devices = Arc::new(MockMediaDevices::new(false));
        let mut media = MediaSource::new(devices.clone());
        media.acquire().await.unwrap();

        devices.refuse_video(true);
        let err = media.set_camera_enabled(true).await.unwrap_err();
        assert!(matches!(err, RtcError::MediaUnavailable(_)));
        assert!(media.stream().unwrap().video_track().is_none());
    }

    #[tokio::test]
    async fn mic_toggle_without_audio_is_noop() {
        let devices = Arc::new(MockMediaDevices::new(false));
        let mut media = MediaSource::new(devices);
        assert!(!media.set_mic_enabled(false));

        media.acquire().await.unwrap();
        assert!(media.set_mic_enabled(false));
        assert!(!media.stream().unwrap().audio_track().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn release_stops_tracks() {
        let devices = Arc::new(MockMediaDevices::new(true));
        let mut media = MediaSource::new(devices);
        media.acquire().await.unwrap();
        let tracks = media.tracks();

        media.release();
        assert!(media.stream().is_none());
        assert!(tracks.iter().all(LocalTrack::is_stopped));
    }
}
