//! TURN 자격증명 발급 핸들러

use crate::config::TurnConfig;
use crate::protocol::{now_secs, TurnCredentials, TurnCredentialsResponse};
use crate::state::AppState;
use axum::{extract::State, Json};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::sync::Arc;

type HmacSha1 = Hmac<Sha1>;

/// `GET /api/turn-credentials`
pub async fn turn_credentials_handler(
    State(state): State<Arc<AppState>>,
) -> Json<TurnCredentialsResponse> {
    let credentials = issue_credentials(&state.config.turn, now_secs());
    if credentials.is_none() {
        tracing::debug!("TURN server not configured, answering with null credentials");
    }
    Json(TurnCredentialsResponse { credentials })
}

/// TURN 자격증명 생성 (RFC 5766 HMAC-SHA1, 시간 제한 username)
pub fn issue_credentials(config: &TurnConfig, now: u64) -> Option<TurnCredentials> {
    if !config.is_configured() {
        return None;
    }

    let expiry_time = now + config.credential_ttl;
    let random: u64 = rand::random();
    let username = format!("{}:{:x}", expiry_time, random);

    let credential = match generate_hmac_hash(&username, &config.secret) {
        Ok(credential) => credential,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to sign TURN credential");
            return None;
        }
    };

    Some(TurnCredentials {
        username: Some(username),
        credential: Some(credential),
        urls: build_turn_urls(config),
    })
}

fn generate_hmac_hash(username: &str, secret: &str) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())?;
    mac.update(username.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn build_turn_urls(config: &TurnConfig) -> Vec<String> {
    let mut urls = Vec::new();

    if config.enable_udp {
        urls.push(format!("turn:{}:{}", config.url, config.ports.udp));
    }
    if config.enable_tcp {
        urls.push(format!(
            "turn:{}:{}?transport=tcp",
            config.url, config.ports.tcp
        ));
    }
    if config.enable_tls {
        urls.push(format!(
            "turns:{}:{}?transport=tcp",
            config.url, config.ports.tls
        ));
    }

    // 폴백 서버 추가
    for fallback in &config.fallback_servers {
        if config.enable_tls {
            urls.push(format!("turns:{}:{}?transport=tcp", fallback, config.ports.tls));
        } else {
            urls.push(format!("turn:{}:{}", fallback, config.ports.udp));
        }
    }

    urls
}
