//! 로컬/원격 미디어 트랙
//!
//! 트랙 시작/중지는 연결 관리자만, `enabled` 토글은 과금 엔진만 한다.
//! `stop()`이 항상 우선하며 중지된 트랙의 enabled 변경은 무시된다.

use crate::error::MediaAcquisitionError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// 미디어 트랙 핸들
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_stopped() {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    /// 처음 중지한 호출만 true
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }
}

/// 미디어 획득 조건 (방 기능 플래그에서 유도)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

/// 로컬 미디어 스트림
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// 중지된 트랙 수
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// 카메라/마이크 접근
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaAcquisitionError>;
}

/// 과금 엔진의 영상 동결 대상. 로컬과 원격 영상 트랙을 함께 잡고 있으며,
/// 동결 중에 들어온 원격 트랙은 바로 비활성화된다.
#[derive(Debug, Default)]
pub struct VideoGate {
    local: RwLock<Vec<Arc<MediaTrack>>>,
    remote: RwLock<Vec<Arc<MediaTrack>>>,
    frozen: AtomicBool,
}

impl VideoGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach_local(&self, stream: &MediaStream) {
        let frozen = self.is_frozen();
        let mut local = self.local.write();
        for track in stream.video_tracks() {
            track.set_enabled(!frozen);
            local.push(track.clone());
        }
    }

    pub fn attach_remote(&self, track: Arc<MediaTrack>) {
        if track.kind() != TrackKind::Video {
            return;
        }
        track.set_enabled(!self.is_frozen());
        self.remote.write().push(track);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
        self.apply(false);
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::SeqCst);
        self.apply(true);
    }

    /// 중지되지 않은 모든 영상 트랙이 활성 상태인지
    pub fn all_enabled(&self) -> bool {
        self.live().all(|t| t.is_enabled())
    }

    pub fn all_disabled(&self) -> bool {
        self.live().all(|t| !t.is_enabled())
    }

    fn live(&self) -> impl Iterator<Item = Arc<MediaTrack>> {
        let mut tracks: Vec<Arc<MediaTrack>> = self.local.read().clone();
        tracks.extend(self.remote.read().iter().cloned());
        tracks.into_iter().filter(|t| !t.is_stopped())
    }

    fn apply(&self, enabled: bool) {
        for track in self.local.read().iter().chain(self.remote.read().iter()) {
            track.set_enabled(enabled);
        }
    }
}
