//! 통화 수명주기 에러 분류

use thiserror::Error;

/// 로컬 미디어 획득 실패. 해당 `initialize` 호출에 치명적이며 자동 재시도 없음.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("no capture devices available")]
    NoDevices,
    #[error("media acquisition failed: {0}")]
    Device(String),
}

/// 잘못된 형식이거나 역할이 맞지 않는 시그널링/사이드 채널 메시지.
/// 메시지는 버려지고 연결은 유지된다.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("{kind}: invalid field `{field}`")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("{kind}: room must not be empty")]
    EmptyRoom { kind: &'static str },
    #[error("message for room `{got}` while bound to `{expected}`")]
    RoomMismatch { expected: String, got: String },
    #[error("`{kind}` is not valid for the {role} role")]
    RoleMismatch {
        kind: &'static str,
        role: &'static str,
    },
}

/// ICE/전송 계층 실패.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("connection failed after {attempts} restart attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("invalid connection state: {0}")]
    InvalidState(&'static str),
}

/// 결제 협력자가 보고하는 실패.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("payment rejected by user")]
    UserRejected,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("payment timed out")]
    Timeout,
}

impl PaymentError {
    /// `billing_failed` 메시지에 실리는 기계 판독용 코드
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserRejected => "user_rejected",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Rpc(_) => "rpc_error",
            Self::Timeout => "timeout",
        }
    }
}

/// 방 생성/변경 실패
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoomError {
    #[error("rate {0} per minute is outside [0.1, 100]")]
    RateOutOfRange(f64),
    #[error("capabilities are locked once a peer has joined")]
    CapabilitiesLocked,
}

/// 통화 세션 전체의 에러
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
