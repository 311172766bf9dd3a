//! 결제 분배 계산 (호스트 85%, 플랫폼 15%)

/// 최소 단위 (소수점 6자리)
pub const UNITS_PER_TOKEN: f64 = 1_000_000.0;
pub const HOST_PERCENT: f64 = 0.85;
pub const PLATFORM_PERCENT: f64 = 0.15;
/// 선결제 분 수
pub const PREPAID_MINUTES: f64 = 3.0;

/// 거래당 분배액. 저장하지 않고 매번 계산한다.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaymentSplit {
    pub host_share: f64,
    pub platform_share: f64,
}

/// 각 몫을 최소 단위로 내림한다. 두 몫의 합은 `total`보다
/// 최대 2 최소 단위 작을 수 있다.
pub fn split(total: f64) -> PaymentSplit {
    PaymentSplit {
        host_share: floor_units(total * HOST_PERCENT),
        platform_share: floor_units(total * PLATFORM_PERCENT),
    }
}

/// 통화 시작 전 선결제액 (분당 요금 x 3)
pub fn prepayment_amount(rate_per_minute: f64) -> f64 {
    rate_per_minute * PREPAID_MINUTES
}

fn floor_units(amount: f64) -> f64 {
    (amount * UNITS_PER_TOKEN).floor() / UNITS_PER_TOKEN
}
