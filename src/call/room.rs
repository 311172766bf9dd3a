//! 방 메타데이터

use crate::error::RoomError;
use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

pub const MIN_RATE: f64 = 0.1;
pub const MAX_RATE: f64 = 100.0;
const JOIN_CODE_LEN: usize = 6;

/// 통화 참여자 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 방을 만들고 결제를 받는 쪽
    Host,
    /// 참여하고 분당 과금되는 쪽
    Invitee,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Invitee => "invitee",
        }
    }
}

/// 방 기능 플래그
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub camera: bool,
    pub microphone: bool,
    pub file_purchase: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            camera: true,
            microphone: true,
            file_purchase: false,
        }
    }
}

/// 호스트가 한 번 만드는 방. 생성 후에는 피어 참여 전 기능 토글만 허용된다.
#[derive(Debug, Clone)]
pub struct Room {
    id: String,
    join_code: String,
    rate_per_minute: f64,
    host_wallet: String,
    capabilities: Capabilities,
    locked: bool,
}

impl Room {
    pub fn new(
        host_wallet: impl Into<String>,
        rate_per_minute: f64,
        capabilities: Capabilities,
    ) -> Result<Self, RoomError> {
        if !(MIN_RATE..=MAX_RATE).contains(&rate_per_minute) {
            return Err(RoomError::RateOutOfRange(rate_per_minute));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            join_code: generate_join_code(),
            rate_per_minute,
            host_wallet: host_wallet.into(),
            capabilities,
            locked: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn join_code(&self) -> &str {
        &self.join_code
    }

    pub fn rate_per_minute(&self) -> f64 {
        self.rate_per_minute
    }

    pub fn host_wallet(&self) -> &str {
        &self.host_wallet
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) -> Result<(), RoomError> {
        if self.locked {
            return Err(RoomError::CapabilitiesLocked);
        }
        self.capabilities = capabilities;
        Ok(())
    }

    /// 피어가 참여하면 호출. 이후 기능 토글 불가.
    pub fn lock(&mut self) {
        self.locked = true;
    }
}

fn generate_join_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOIN_CODE_LEN)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect()
}
