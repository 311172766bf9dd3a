//! 경계 검증: 메시지 종류별 검증 함수
//!
//! 역직렬화(필수 필드, 필드 타입)는 serde가 담당하고, 여기서는 값의 의미를
//! 검사한다. 실패한 메시지는 버려지고 채널은 계속 사용된다.

use super::channel::ChannelMessage;
use super::messages::{IceCandidate, RelayEnvelope, SdpKind, SessionDescription, SignalingMessage};
use crate::error::ProtocolError;
use serde::Deserialize;

/// 시그널링 텍스트 프레임 파싱 + 검증
pub fn parse_signaling(text: &str) -> Result<SignalingMessage, ProtocolError> {
    let msg: SignalingMessage =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    validate_signaling(&msg)?;
    Ok(msg)
}

/// 사이드 채널 텍스트 프레임 파싱 + 검증.
/// 애플리케이션 메시지는 방 필드가 없지만, 보내왔다면 비어 있으면 안 된다.
pub fn parse_channel(text: &str) -> Result<ChannelMessage, ProtocolError> {
    let malformed = |e: serde_json::Error| ProtocolError::Malformed(e.to_string());
    let value: serde_json::Value = serde_json::from_str(text).map_err(malformed)?;
    let envelope = RelayEnvelope::deserialize(&value).map_err(malformed)?;
    let msg = ChannelMessage::deserialize(value).map_err(malformed)?;
    if let Some(room) = &envelope.room {
        check_room(msg.kind(), room)?;
    }
    validate_channel(&msg)?;
    Ok(msg)
}

pub fn validate_signaling(msg: &SignalingMessage) -> Result<(), ProtocolError> {
    match msg {
        SignalingMessage::Join { room } => check_join(room),
        SignalingMessage::PeerJoined { room } => check_peer_joined(room),
        SignalingMessage::Offer { room, payload } => check_offer(room, payload),
        SignalingMessage::Answer { room, payload } => check_answer(room, payload),
        SignalingMessage::Candidate { room, payload } => check_candidate(room, payload),
    }
}

pub fn validate_channel(msg: &ChannelMessage) -> Result<(), ProtocolError> {
    match msg {
        ChannelMessage::BillingAttempt { amount, .. } => check_billing_attempt(*amount),
        ChannelMessage::BillingSuccess {
            amount, txid, total, ..
        } => check_billing_success(*amount, txid, *total),
        ChannelMessage::BillingFailed { amount, code, .. } => check_billing_failed(*amount, code),
        ChannelMessage::BillingFrozen { .. } | ChannelMessage::BillingUnfrozen { .. } => Ok(()),
        ChannelMessage::Tip { amount, txid, .. } => check_tip(*amount, txid),
        ChannelMessage::FilePurchase {
            file_id,
            amount,
            txid,
            ..
        } => check_file_purchase(file_id, *amount, txid),
    }
}

fn check_room(kind: &'static str, room: &str) -> Result<(), ProtocolError> {
    if room.trim().is_empty() {
        return Err(ProtocolError::EmptyRoom { kind });
    }
    Ok(())
}

fn check_amount(kind: &'static str, amount: f64) -> Result<(), ProtocolError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(ProtocolError::InvalidField {
            kind,
            field: "amount",
        });
    }
    Ok(())
}

fn check_non_empty(kind: &'static str, field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::InvalidField { kind, field });
    }
    Ok(())
}

fn check_description(
    kind: &'static str,
    room: &str,
    payload: &SessionDescription,
    expected: SdpKind,
) -> Result<(), ProtocolError> {
    check_room(kind, room)?;
    if payload.kind != expected {
        return Err(ProtocolError::InvalidField {
            kind,
            field: "payload.type",
        });
    }
    check_non_empty(kind, "payload.sdp", &payload.sdp)
}

fn check_join(room: &str) -> Result<(), ProtocolError> {
    check_room("join", room)
}

fn check_peer_joined(room: &str) -> Result<(), ProtocolError> {
    check_room("peer-joined", room)
}

fn check_offer(room: &str, payload: &SessionDescription) -> Result<(), ProtocolError> {
    check_description("offer", room, payload, SdpKind::Offer)
}

fn check_answer(room: &str, payload: &SessionDescription) -> Result<(), ProtocolError> {
    check_description("answer", room, payload, SdpKind::Answer)
}

fn check_candidate(room: &str, payload: &IceCandidate) -> Result<(), ProtocolError> {
    check_room("candidate", room)?;
    check_non_empty("candidate", "payload.candidate", &payload.candidate)
}

fn check_billing_attempt(amount: f64) -> Result<(), ProtocolError> {
    check_amount("billing_attempt", amount)
}

fn check_billing_success(amount: f64, txid: &str, total: Option<f64>) -> Result<(), ProtocolError> {
    check_amount("billing_success", amount)?;
    check_non_empty("billing_success", "txid", txid)?;
    if let Some(total) = total {
        if !total.is_finite() || total < amount {
            return Err(ProtocolError::InvalidField {
                kind: "billing_success",
                field: "total",
            });
        }
    }
    Ok(())
}

fn check_billing_failed(amount: f64, code: &str) -> Result<(), ProtocolError> {
    check_amount("billing_failed", amount)?;
    check_non_empty("billing_failed", "code", code)
}

fn check_tip(amount: f64, txid: &str) -> Result<(), ProtocolError> {
    check_amount("tip", amount)?;
    check_non_empty("tip", "txid", txid)
}

fn check_file_purchase(file_id: &str, amount: f64, txid: &str) -> Result<(), ProtocolError> {
    check_non_empty("file_purchase", "file_id", file_id)?;
    check_amount("file_purchase", amount)?;
    check_non_empty("file_purchase", "txid", txid)
}
