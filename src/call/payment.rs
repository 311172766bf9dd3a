//! 외부 결제 협력자 인터페이스

use crate::error::PaymentError;
use async_trait::async_trait;

/// 결제 완료 영수증
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// 원장이 돌려준 불투명 거래 ID
    pub txid: String,
}

/// 지갑/원장 협력자. 내부적으로 85/15 분배를 수행한다.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn submit_split_payment(
        &self,
        payer: &str,
        recipient: &str,
        total_amount: f64,
        platform: &str,
    ) -> Result<PaymentReceipt, PaymentError>;
}

/// 결제 당사자
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parties {
    pub payer: String,
    pub recipient: String,
    pub platform: String,
}
