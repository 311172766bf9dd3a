//! 시그널링 중계 핸들러
//!
//! 메시지는 검증하지 않고 원문 그대로 같은 방의 다른 멤버에게 전달한다.
//! 검증은 수신 측 책임이다.

use crate::protocol::RelayEnvelope;
use crate::state::AppState;

/// 클라이언트 텍스트 프레임 처리
pub fn handle_text(state: &AppState, peer_id: &str, text: &str) {
    let envelope = match serde_json::from_str::<RelayEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(peer_id = %peer_id, error = %e, "Dropped unroutable frame");
            return;
        }
    };

    let Some(room_id) = envelope.room.as_deref() else {
        tracing::debug!(peer_id = %peer_id, kind = %envelope.kind, "Dropped frame without room");
        return;
    };

    if envelope.kind == "join" {
        crate::handlers::room::handle_join(state, peer_id, room_id);
    } else {
        handle_relay(state, peer_id, room_id, &envelope.kind, text);
    }
}

/// 방의 발신자 외 모든 멤버에게 원문 전달. 빈 방/없는 방이면 조용히 버린다.
pub fn handle_relay(state: &AppState, from_peer_id: &str, room_id: &str, kind: &str, text: &str) {
    let delivered = broadcast_to_room_except(state, room_id, from_peer_id, text);

    tracing::debug!(
        from = %from_peer_id,
        room_id = %room_id,
        kind = %kind,
        delivered = delivered,
        "Relayed message"
    );
}

/// 방의 특정 피어를 제외하고 브로드캐스트
fn broadcast_to_room_except(state: &AppState, room_id: &str, except_peer_id: &str, text: &str) -> usize {
    let Some(room) = state.rooms.get(room_id) else {
        return 0;
    };

    let mut delivered = 0;
    for peer_id in room.members.iter().filter(|id| id.as_str() != except_peer_id) {
        if let Some(session) = state.peers.get(peer_id) {
            if session.sender.send(text.to_string()).is_ok() {
                delivered += 1;
            }
        }
    }
    delivered
}
