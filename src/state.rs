//! 릴레이 상태 관리

use crate::config::Config;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

/// 릴레이 전역 상태. 방 기록은 보관하지 않는다.
pub struct AppState {
    /// 방 정보 (room_id -> Room)
    pub rooms: DashMap<String, Room>,
    /// 피어 세션 (peer_id -> PeerSession)
    pub peers: DashMap<String, PeerSession>,
    /// 설정
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            rooms: DashMap::new(),
            peers: DashMap::new(),
            config: Arc::new(config),
        }
    }

    /// 방 인원 수 (없는 방은 0)
    pub fn room_size(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }
}

/// 방 정보
pub struct Room {
    pub members: HashSet<String>,
    pub created_at: Instant,
}

impl Room {
    pub fn new() -> Self {
        Self {
            members: HashSet::new(),
            created_at: Instant::now(),
        }
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

/// 피어 세션 정보
pub struct PeerSession {
    pub id: String,
    /// 참여 중인 방 목록 (연결 해제 시 전부 탈퇴)
    pub rooms: HashSet<String>,
    /// 텍스트 프레임 송신 채널
    pub sender: UnboundedSender<String>,
    pub connected_at: Instant,
}
