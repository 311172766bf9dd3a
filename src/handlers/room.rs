//! 방 관리 핸들러

use crate::protocol::SignalingMessage;
use crate::state::{AppState, Room};

/// 방 참여 처리. 방은 첫 참여 시 암묵적으로 생성되고,
/// 기존 멤버 전원에게 `peer-joined`가 전달된다.
pub fn handle_join(state: &AppState, peer_id: &str, room_id: &str) {
    let room_id = room_id.trim();
    if room_id.is_empty() || !state.peers.contains_key(peer_id) {
        tracing::debug!(peer_id = %peer_id, "Ignoring join without room or session");
        return;
    }

    // DashMap 엔트리는 이 스코프 안에서만 잡는다
    let existing: Vec<String> = {
        let mut room = state.rooms.entry(room_id.to_string()).or_insert_with(|| {
            tracing::info!(room_id = %room_id, "Room created");
            Room::new()
        });
        if !room.members.insert(peer_id.to_string()) {
            tracing::debug!(peer_id = %peer_id, room_id = %room_id, "Already a member");
            return;
        }
        room.members
            .iter()
            .filter(|id| id.as_str() != peer_id)
            .cloned()
            .collect()
    };

    if let Some(mut session) = state.peers.get_mut(peer_id) {
        session.rooms.insert(room_id.to_string());
    }

    let notice = SignalingMessage::PeerJoined {
        room: room_id.to_string(),
    };
    match serde_json::to_string(&notice) {
        Ok(text) => {
            for member in &existing {
                if let Some(session) = state.peers.get(member) {
                    let _ = session.sender.send(text.clone());
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode peer-joined"),
    }

    tracing::info!(
        peer_id = %peer_id,
        room_id = %room_id,
        user_count = existing.len() + 1,
        "User joined room"
    );
}

/// 피어가 참여한 모든 방에서 탈퇴. 빈 방은 즉시 삭제한다.
pub fn handle_leave(state: &AppState, peer_id: &str) {
    let rooms: Vec<String> = match state.peers.get_mut(peer_id) {
        Some(mut session) => session.rooms.drain().collect(),
        None => return,
    };

    for room_id in rooms {
        let remaining = match state.rooms.get_mut(&room_id) {
            Some(mut room) => {
                room.members.remove(peer_id);
                room.members.len()
            }
            None => continue,
        };

        tracing::info!(
            peer_id = %peer_id,
            room_id = %room_id,
            remaining = remaining,
            "User left room"
        );

        if let Some((_, room)) = state
            .rooms
            .remove_if(&room_id, |_, room| room.members.is_empty())
        {
            tracing::info!(
                room_id = %room_id,
                lifetime_secs = room.created_at.elapsed().as_secs(),
                "Room deleted"
            );
        }
    }
}
