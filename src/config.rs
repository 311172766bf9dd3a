//! 환경 변수 기반 설정 관리

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 기본 공개 STUN 서버
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn list_var(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 릴레이 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
    pub turn: TurnConfig,
    pub log_level: String,
}

/// TURN 자격증명 발급 설정
#[derive(Debug, Clone, Default)]
pub struct TurnConfig {
    pub url: String,
    pub secret: String,
    pub enable_tls: bool,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub ports: TurnPorts,
    pub credential_ttl: u64,
    pub fallback_servers: Vec<String>,
}

/// TURN 포트 설정
#[derive(Debug, Clone)]
pub struct TurnPorts {
    pub udp: u16,
    pub tcp: u16,
    pub tls: u16,
}

impl Default for TurnPorts {
    fn default() -> Self {
        Self {
            udp: 3478,
            tcp: 3478,
            tls: 443,
        }
    }
}

impl TurnConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.secret.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5502,
            host: "0.0.0.0".to_string(),
            cors_origins: Vec::new(),
            turn: TurnConfig {
                enable_udp: true,
                enable_tcp: true,
                credential_ttl: 3600,
                ..TurnConfig::default()
            },
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            port: var_or("PORT", defaults.port),
            host: env::var("HOST").unwrap_or(defaults.host),
            cors_origins: list_var("CORS_ORIGINS"),
            turn: TurnConfig {
                url: env::var("TURN_SERVER_URL").unwrap_or_default(),
                secret: env::var("TURN_SECRET").unwrap_or_default(),
                enable_tls: env::var("TURN_ENABLE_TLS")
                    .map(|v| v == "true")
                    .unwrap_or(false),
                enable_udp: env::var("TURN_ENABLE_UDP")
                    .map(|v| v != "false")
                    .unwrap_or(true),
                enable_tcp: env::var("TURN_ENABLE_TCP")
                    .map(|v| v != "false")
                    .unwrap_or(true),
                ports: TurnPorts {
                    udp: var_or("TURN_PORT_UDP", 3478),
                    tcp: var_or("TURN_PORT_TCP", 3478),
                    tls: var_or("TURN_PORT_TLS", 443),
                },
                credential_ttl: var_or("TURN_CREDENTIAL_TTL", defaults.turn.credential_ttl),
                fallback_servers: list_var("TURN_FALLBACK_SERVERS"),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

/// ICE 서버 목록 해석 설정
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// 항상 목록 앞쪽에 들어가는 STUN URL
    pub stun_urls: Vec<String>,
    /// TURN 자격증명 발급 엔드포인트 (없으면 STUN만 사용)
    pub credentials_url: Option<String>,
    pub fetch_timeout: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            credentials_url: None,
            fetch_timeout: Duration::from_millis(5000),
        }
    }
}

/// 과금 타이머 설정
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// 연결 후 첫 결제 시도까지 (선결제 3분)
    pub first_attempt_delay: Duration,
    pub interval: Duration,
    pub retry_delay: Duration,
    pub termination_delay: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            first_attempt_delay: Duration::from_secs(180),
            interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
            termination_delay: Duration::from_secs(3),
        }
    }
}

/// 피어 연결 관리자 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_restarts: u32,
    pub side_channel_label: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            side_channel_label: "paycall".to_string(),
        }
    }
}

/// 클라이언트(통화 참여자) 설정
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub signaling_url: String,
    pub platform_wallet: String,
    pub ice: IceConfig,
    pub billing: BillingConfig,
    pub connection: ConnectionConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:5502/ws".to_string(),
            platform_wallet: String::new(),
            ice: IceConfig::default(),
            billing: BillingConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl CallConfig {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let stun_urls = match list_var("STUN_URLS") {
            urls if urls.is_empty() => defaults.ice.stun_urls,
            urls => urls,
        };

        Self {
            signaling_url: env::var("SIGNALING_URL").unwrap_or(defaults.signaling_url),
            platform_wallet: env::var("PLATFORM_WALLET").unwrap_or_default(),
            ice: IceConfig {
                stun_urls,
                credentials_url: env::var("TURN_CREDENTIALS_URL")
                    .ok()
                    .filter(|s| !s.is_empty()),
                fetch_timeout: Duration::from_millis(var_or("ICE_FETCH_TIMEOUT_MS", 5000)),
            },
            billing: BillingConfig {
                first_attempt_delay: Duration::from_secs(var_or("BILLING_FIRST_ATTEMPT_SECS", 180)),
                interval: Duration::from_secs(var_or("BILLING_INTERVAL_SECS", 60u64).max(1)),
                retry_delay: Duration::from_secs(var_or("BILLING_RETRY_SECS", 5)),
                termination_delay: Duration::from_secs(var_or("BILLING_TERMINATE_SECS", 3)),
            },
            connection: ConnectionConfig {
                max_restarts: var_or("MAX_CONNECTION_RESTARTS", defaults.connection.max_restarts),
                side_channel_label: env::var("SIDE_CHANNEL_LABEL")
                    .unwrap_or(defaults.connection.side_channel_label),
            },
        }
    }
}
