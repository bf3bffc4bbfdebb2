//! Захват локальных медиа-дорожек и наборы дорожек сессии.

use crate::error::{Result, SessionError};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// stream id, по которому удалённая сторона узнаёт демонстрацию экрана
pub const SCREEN_STREAM_ID: &str = "screen";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::Screen => "screen",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
}

/// `video` в mediaConfig: либо флаг, либо желаемый размер кадра
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum VideoRequest {
    Enabled(bool),
    Profile(VideoProfile),
}

impl Default for VideoRequest {
    fn default() -> Self {
        VideoRequest::Enabled(false)
    }
}

impl VideoRequest {
    pub fn is_enabled(&self) -> bool {
        match self {
            VideoRequest::Enabled(on) => *on,
            VideoRequest::Profile(_) => true,
        }
    }
}

/// Желаемые локальные медиа для одной попытки согласования
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaRequest {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: VideoRequest,
    #[serde(default)]
    pub screen: bool,
}

impl MediaRequest {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            ..Default::default()
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: VideoRequest::Enabled(true),
            screen: false,
        }
    }

    pub fn video_only() -> Self {
        Self {
            video: VideoRequest::Enabled(true),
            ..Default::default()
        }
    }

    pub fn wants_media(&self) -> bool {
        self.audio || self.video.is_enabled() || self.screen
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::with_capacity(3);
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video.is_enabled() {
            kinds.push(TrackKind::Video);
        }
        if self.screen {
            kinds.push(TrackKind::Screen);
        }
        kinds
    }

    /// Запрос удалённой стороны, уточнённый локальными настройками.
    ///
    /// Явно заданные локально audio/video побеждают, демонстрацию экрана
    /// может запросить только удалённая сторона.
    pub fn merged_with(&self, pref: &MediaPreference) -> MediaRequest {
        MediaRequest {
            audio: pref.audio.unwrap_or(self.audio),
            video: pref.video.unwrap_or(self.video),
            screen: self.screen,
        }
    }
}

/// Локальные предпочтения; `None` значит "как попросит собеседник"
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaPreference {
    #[serde(default)]
    pub audio: Option<bool>,
    #[serde(default)]
    pub video: Option<VideoRequest>,
}

/// Дорожка захвата или приёма, которую нужно явно остановить
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn is_stopped(&self) -> bool;

    /// Локальная дорожка webrtc, если это дорожка захвата
    fn local(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Дорожка поверх `TrackLocalStaticSample` (или удалённая, без `local`)
pub struct CaptureTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
    sample: Option<Arc<TrackLocalStaticSample>>,
}

impl CaptureTrack {
    pub fn capture(kind: TrackKind) -> Self {
        let id = random_id();
        let (mime, stream_id) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, "local-audio"),
            TrackKind::Video => (MIME_TYPE_VP8, "local-video"),
            TrackKind::Screen => (MIME_TYPE_VP8, SCREEN_STREAM_ID),
        };
        let sample = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        );
        Self {
            id,
            kind,
            stopped: AtomicBool::new(false),
            sample: Some(Arc::new(sample)),
        }
    }

    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
            sample: None,
        }
    }
}

impl MediaTrack for CaptureTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stopped {} track {}", self.kind, self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn local(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        self.sample
            .clone()
            .map(|s| s as Arc<dyn TrackLocal + Send + Sync>)
    }
}

/// Набор дорожек одной стороны звонка
#[derive(Clone, Default)]
pub struct TrackSet {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl fmt::Debug for TrackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tracks.iter().map(|t| (t.kind(), t.id().to_string())))
            .finish()
    }
}

impl From<Vec<Arc<dyn MediaTrack>>> for TrackSet {
    fn from(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }
}

impl TrackSet {
    pub fn push(&mut self, track: Arc<dyn MediaTrack>) {
        self.tracks.push(track);
    }

    pub fn extend(&mut self, other: &TrackSet) {
        self.tracks.extend(other.tracks.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn of_kind(&self, kind: TrackKind) -> TrackSet {
        TrackSet {
            tracks: self
                .tracks
                .iter()
                .filter(|t| t.kind() == kind)
                .cloned()
                .collect(),
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn take(&mut self) -> TrackSet {
        TrackSet {
            tracks: std::mem::take(&mut self.tracks),
        }
    }
}

/// Источник устройств захвата (getUserMedia)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, request: &MediaRequest) -> Result<Vec<Arc<dyn MediaTrack>>>;
}

/// Какие устройства захвата есть на этой машине
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicesConfig {
    #[serde(default = "enabled")]
    pub audio: bool,
    #[serde(default = "enabled")]
    pub video: bool,
    #[serde(default)]
    pub screen: bool,
}

fn enabled() -> bool {
    true
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            screen: false,
        }
    }
}

/// Устройства на базе `TrackLocalStaticSample` (Opus / VP8)
#[derive(Debug, Clone, Default)]
pub struct LocalDevices {
    available: DevicesConfig,
}

impl LocalDevices {
    pub fn new(available: DevicesConfig) -> Self {
        Self { available }
    }

    fn has_device(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.available.audio,
            TrackKind::Video => self.available.video,
            TrackKind::Screen => self.available.screen,
        }
    }
}

#[async_trait]
impl MediaDevices for LocalDevices {
    async fn open(&self, request: &MediaRequest) -> Result<Vec<Arc<dyn MediaTrack>>> {
        if let Some(missing) = request.kinds().into_iter().find(|k| !self.has_device(*k)) {
            return Err(SessionError::MediaUnavailable(format!(
                "no {} capture device",
                missing
            )));
        }
        if let VideoRequest::Profile(p) = request.video {
            debug!("Opening camera at {}x{}", p.width, p.height);
        }
        Ok(request
            .kinds()
            .into_iter()
            .map(|kind| Arc::new(CaptureTrack::capture(kind)) as Arc<dyn MediaTrack>)
            .collect())
    }
}

struct MediaState {
    /// растёт при каждом release; захват со старой эпохой отбрасывается
    epoch: u64,
    tracks: TrackSet,
}

/// Локальные дорожки одной сессии
pub struct MediaSession {
    devices: Arc<dyn MediaDevices>,
    state: Mutex<MediaState>,
}

impl MediaSession {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: Mutex::new(MediaState {
                epoch: 0,
                tracks: TrackSet::default(),
            }),
        }
    }

    /// Захватывает дорожки под запрос.
    ///
    /// Если до завершения захвата был вызван [`MediaSession::release`],
    /// полученные дорожки сразу останавливаются и возвращается
    /// [`SessionError::Cancelled`].
    pub async fn acquire(&self, request: &MediaRequest) -> Result<TrackSet> {
        if !request.wants_media() {
            return Ok(TrackSet::default());
        }
        let epoch = self.state.lock().epoch;
        let opened = TrackSet::from(self.devices.open(request).await?);

        let mut state = self.state.lock();
        if state.epoch != epoch {
            drop(state);
            info!("Media acquired after release, stopping {} tracks", opened.len());
            opened.stop_all();
            return Err(SessionError::Cancelled);
        }
        state.tracks.extend(&opened);
        Ok(opened)
    }

    /// Останавливает все дорожки; повторный вызов ничего не делает
    pub fn release(&self) {
        let released = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.tracks.take()
        };
        if !released.is_empty() {
            debug!("Releasing {} local tracks", released.len());
        }
        released.stop_all();
    }

    pub fn tracks(&self) -> TrackSet {
        self.state.lock().tracks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{oneshot, Notify};

    /// Устройство, которое отдаёт дорожки только по сигналу
    struct GatedDevices {
        entered: Notify,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        opened: Mutex<Vec<Arc<dyn MediaTrack>>>,
    }

    #[async_trait]
    impl MediaDevices for GatedDevices {
        async fn open(&self, request: &MediaRequest) -> Result<Vec<Arc<dyn MediaTrack>>> {
            self.entered.notify_one();
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let tracks: Vec<Arc<dyn MediaTrack>> = request
                .kinds()
                .into_iter()
                .map(|k| Arc::new(CaptureTrack::remote(random_id(), k)) as Arc<dyn MediaTrack>)
                .collect();
            self.opened.lock().extend(tracks.iter().cloned());
            Ok(tracks)
        }
    }

    #[test]
    fn merge_prefers_local_explicit_choice() {
        let remote = MediaRequest {
            audio: true,
            video: VideoRequest::Enabled(true),
            screen: true,
        };
        let pref = MediaPreference {
            audio: None,
            video: Some(VideoRequest::Enabled(false)),
        };
        let merged = remote.merged_with(&pref);
        assert!(merged.audio);
        assert!(!merged.video.is_enabled());
        assert!(merged.screen);

        let merged = MediaRequest::audio_only().merged_with(&MediaPreference::default());
        assert_eq!(merged, MediaRequest::audio_only());
    }

    #[test]
    fn empty_request_wants_nothing() {
        assert!(!MediaRequest::default().wants_media());
        assert!(MediaRequest::video_only().wants_media());
        assert_eq!(
            MediaRequest::audio_video().kinds(),
            vec![TrackKind::Audio, TrackKind::Video]
        );
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let media = MediaSession::new(Arc::new(LocalDevices::default()));
        media.release();
        let tracks = media.acquire(&MediaRequest::audio_video()).await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.local().is_some()));

        media.release();
        media.release();
        assert!(tracks.iter().all(|t| t.is_stopped()));
        assert!(media.tracks().is_empty());
    }

    #[tokio::test]
    async fn missing_device_is_media_unavailable() {
        let media = MediaSession::new(Arc::new(LocalDevices::default()));
        let request = MediaRequest {
            screen: true,
            ..Default::default()
        };
        let err = media.acquire(&request).await.unwrap_err();
        assert!(matches!(err, SessionError::MediaUnavailable(_)));
    }

    #[tokio::test]
    async fn release_during_acquire_stops_late_tracks() {
        let (tx, rx) = oneshot::channel();
        let devices = Arc::new(GatedDevices {
            entered: Notify::new(),
            gate: Mutex::new(Some(rx)),
            opened: Mutex::new(Vec::new()),
        });
        let media = Arc::new(MediaSession::new(devices.clone()));

        let pending = tokio::spawn({
            let media = media.clone();
            async move { media.acquire(&MediaRequest::audio_only()).await }
        });
        devices.entered.notified().await;

        media.release();
        tx.send(()).unwrap();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), SessionError::Cancelled);
        let opened = devices.opened.lock();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].is_stopped());
        assert!(media.tracks().is_empty());
    }
}
