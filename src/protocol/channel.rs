//! 사이드 채널(데이터 채널) 애플리케이션 메시지

use serde::{Deserialize, Serialize};

/// 미디어 연결 수립 후 데이터 채널로 오가는 메시지.
/// 채널은 순서가 보장되며 중복 제거는 하지 않는다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    BillingAttempt {
        amount: f64,
        timestamp: u64,
        #[serde(default)]
        retry: bool,
    },
    BillingSuccess {
        amount: f64,
        txid: String,
        timestamp: u64,
        /// 세션 누적 결제액
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<f64>,
    },
    BillingFailed {
        amount: f64,
        code: String,
        message: String,
        timestamp: u64,
    },
    BillingFrozen {
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    BillingUnfrozen {
        timestamp: u64,
    },
    Tip {
        amount: f64,
        txid: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    FilePurchase {
        file_id: String,
        amount: f64,
        txid: String,
        timestamp: u64,
    },
}

impl ChannelMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BillingAttempt { .. } => "billing_attempt",
            Self::BillingSuccess { .. } => "billing_success",
            Self::BillingFailed { .. } => "billing_failed",
            Self::BillingFrozen { .. } => "billing_frozen",
            Self::BillingUnfrozen { .. } => "billing_unfrozen",
            Self::Tip { .. } => "tip",
            Self::FilePurchase { .. } => "file_purchase",
        }
    }
}
