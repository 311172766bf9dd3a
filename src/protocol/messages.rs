//! 시그널링 와이어 프로토콜 정의
//!
//! `{type, room, payload?}` 형태의 JSON. 릴레이는 `type`과 `room`만 보고
//! 원문을 그대로 전달한다.

use serde::{Deserialize, Serialize};

/// 릴레이를 통해 오가는 시그널링 메시지
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "join")]
    Join { room: String },
    #[serde(rename = "offer")]
    Offer {
        room: String,
        payload: SessionDescription,
    },
    #[serde(rename = "answer")]
    Answer {
        room: String,
        payload: SessionDescription,
    },
    #[serde(rename = "candidate")]
    Candidate { room: String, payload: IceCandidate },
    #[serde(rename = "peer-joined")]
    PeerJoined { room: String },
}

impl SignalingMessage {
    pub fn room(&self) -> &str {
        match self {
            Self::Join { room }
            | Self::Offer { room, .. }
            | Self::Answer { room, .. }
            | Self::Candidate { room, .. }
            | Self::PeerJoined { room } => room,
        }
    }

    /// 와이어 상의 `type` 값
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::PeerJoined { .. } => "peer-joined",
        }
    }
}

/// SDP 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// offer/answer 페이로드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// trickle ICE 후보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

/// 릴레이가 라우팅에 필요한 최소 필드만 읽는 봉투
#[derive(Debug, Clone, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room: Option<String>,
}

/// ICE 서버 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// TURN 자격증명 발급 응답 (`credentials`가 null이면 STUN만 사용)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentialsResponse {
    pub credentials: Option<TurnCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}
