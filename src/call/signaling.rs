//! 릴레이 WebSocket 시그널링 클라이언트

use super::transport::{ConnectionEvent, SignalingChannel, SignalingConnector};
use crate::config::CallConfig;
use crate::error::ConnectionError;
use crate::protocol::SignalingMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// `ws://host:port/ws` 릴레이에 접속하는 연결기
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// 클라이언트 설정의 `signaling_url`로 접속
    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.signaling_url.clone())
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(
        &self,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn SignalingChannel>, ConnectionError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Signaling(e.to_string()))?;
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // 송신 태스크
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // 수신 태스크
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if events.send(ConnectionEvent::Signal(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "Signaling socket receive failed");
                        break;
                    }
                    _ => {}
                }
            }
            let _ = events.send(ConnectionEvent::SignalingClosed);
        });

        tracing::info!(url = %self.url, "Signaling connected");

        Ok(Arc::new(WsSignaling {
            outbound: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        }))
    }
}

/// 열린 시그널링 소켓
pub struct WsSignaling {
    outbound: Mutex<Option<UnboundedSender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    fn send(&self, message: &SignalingMessage) -> Result<(), ConnectionError> {
        let text =
            serde_json::to_string(message).map_err(|e| ConnectionError::Signaling(e.to_string()))?;
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(ConnectionError::Signaling("socket closed".to_string()));
        };
        tx.send(text)
            .map_err(|_| ConnectionError::Signaling("socket closed".to_string()))
    }

    async fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // 송신 채널을 닫으면 writer가 남은 프레임을 보내고 소켓을 닫는다
        self.outbound.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}
