//! ICE 서버 목록 해석
//!
//! 공개 STUN 항목이 항상 첫 번째. TURN 자격증명은 외부 발급 엔드포인트에서
//! 받아오며, 어떤 실패든 경고만 남기고 STUN 전용 목록으로 내려간다.

use crate::config::{IceConfig, DEFAULT_STUN_URL};
use crate::protocol::{IceServer, TurnCredentialsResponse};
use thiserror::Error;

#[derive(Debug, Error)]
enum IceFetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("credentials missing `{0}`")]
    MissingField(&'static str),
}

/// ICE 구성 해석기
#[derive(Debug, Clone)]
pub struct IceResolver {
    config: IceConfig,
    client: reqwest::Client,
}

impl IceResolver {
    pub fn new(config: IceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::default()
            });
        Self { config, client }
    }

    /// 우선순위 순 ICE 서버 목록. 실패하지 않는다.
    pub async fn resolve(&self) -> Vec<IceServer> {
        let mut servers = vec![self.stun_server()];

        let Some(url) = self.config.credentials_url.as_deref() else {
            return servers;
        };

        match self.fetch_turn(url).await {
            Ok(Some(turn)) => {
                tracing::debug!(urls = ?turn.urls, "TURN credentials resolved");
                servers.push(turn);
            }
            Ok(None) => tracing::debug!("No TURN credentials issued, using STUN only"),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "TURN credential fetch failed, using STUN only")
            }
        }

        servers
    }

    fn stun_server(&self) -> IceServer {
        let urls = if self.config.stun_urls.is_empty() {
            vec![DEFAULT_STUN_URL.to_string()]
        } else {
            self.config.stun_urls.clone()
        };
        IceServer {
            urls,
            username: None,
            credential: None,
        }
    }

    async fn fetch_turn(&self, url: &str) -> Result<Option<IceServer>, IceFetchError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(IceFetchError::Status(response.status()));
        }

        let body: TurnCredentialsResponse = response.json().await?;
        let Some(creds) = body.credentials else {
            return Ok(None);
        };

        let username = creds
            .username
            .filter(|u| !u.is_empty())
            .ok_or(IceFetchError::MissingField("username"))?;
        let credential = creds
            .credential
            .filter(|c| !c.is_empty())
            .ok_or(IceFetchError::MissingField("credential"))?;
        if creds.urls.is_empty() {
            return Err(IceFetchError::MissingField("urls"));
        }

        Ok(Some(IceServer {
            urls: creds.urls,
            username: Some(username),
            credential: Some(credential),
        }))
    }
}
