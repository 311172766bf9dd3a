//! PayCall 시그널링 릴레이

use anyhow::Context;
use paycall::config::Config;
use paycall::server;
use paycall::state::AppState;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = format!("{}:{}", config.host, config.port);
    let turn_enabled = config.turn.is_configured();
    let state = Arc::new(AppState::new(config));
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("PayCall signaling relay started");
    tracing::info!(address = %addr, turn = turn_enabled, "WebSocket: ws://{}/ws", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
