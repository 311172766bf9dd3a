//! 연결 핸들러

use crate::state::{AppState, PeerSession};
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// 새 연결 처리
pub fn handle_connection(state: &AppState, sender: UnboundedSender<String>) -> String {
    let peer_id = Uuid::new_v4().to_string();

    let session = PeerSession {
        id: peer_id.clone(),
        rooms: HashSet::new(),
        sender,
        connected_at: Instant::now(),
    };

    state.peers.insert(peer_id.clone(), session);

    tracing::info!(peer_id = %peer_id, "New connection established");
    peer_id
}

/// 연결 해제 처리
pub fn handle_disconnect(state: &AppState, peer_id: &str) {
    crate::handlers::room::handle_leave(state, peer_id);
    if let Some((_, session)) = state.peers.remove(peer_id) {
        tracing::info!(
            peer_id = %session.id,
            connected_ms = session.connected_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}
