//! 시그널링 및 사이드 채널 메시지 프로토콜

pub mod channel;
pub mod messages;
pub mod validate;

pub use channel::ChannelMessage;
pub use messages::*;
pub use validate::{parse_channel, parse_signaling};

use std::time::{SystemTime, UNIX_EPOCH};

/// 유닉스 에포크 기준 밀리초
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// 유닉스 에포크 기준 초
pub fn now_secs() -> u64 {
    now_millis() / 1000
}
