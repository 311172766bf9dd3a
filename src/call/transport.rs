//! 피어 연결 관리자가 의존하는 포트 트레이트
//!
//! 어댑터(WebRTC 스택, 시그널링 소켓)가 구현하며, 관리자는 구체 스택을
//! 참조하지 않는다.

use super::media::MediaTrack;
use crate::error::ConnectionError;
use crate::protocol::{IceCandidate, IceServer, SessionDescription, SignalingMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// 전송 계층이 보고하는 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Failed,
    /// 원격 측 종료
    Closed,
}

/// 전송 어댑터 → 관리자 이벤트
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    LocalCandidate(IceCandidate),
    SideChannelOpen,
    SideChannelClosed,
    SideChannelMessage(String),
    RemoteTrack(Arc<MediaTrack>),
}

/// 관리자가 처리하는 모든 입력
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// 릴레이에서 받은 원문 텍스트 프레임
    Signal(String),
    /// 시그널링 소켓 종료
    SignalingClosed,
    /// 전송 이벤트. 재시작 전 세대의 이벤트는 버려진다.
    Transport {
        generation: u64,
        event: TransportEvent,
    },
}

/// 한 전송 세대에 묶인 이벤트 송신기
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: UnboundedSender<ConnectionEvent>,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: UnboundedSender<ConnectionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(ConnectionEvent::Transport {
            generation: self.generation,
            event,
        });
    }
}

/// 하나의 피어 연결 객체
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), ConnectionError>;

    /// offer 생성 후 로컬 디스크립션으로 설정
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// answer 생성 후 로컬 디스크립션으로 설정
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// 호스트 측에서 사이드 채널 생성. 열리면 `SideChannelOpen` 이벤트.
    fn open_side_channel(&self, label: &str) -> Result<(), ConnectionError>;

    fn send_side_channel(&self, text: String) -> Result<(), ConnectionError>;

    async fn close(&self);
}

/// 연결 객체 생성기 (재시작 시 새 객체를 만든다)
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, ConnectionError>;
}

/// 릴레이로 가는 시그널링 채널
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn send(&self, message: &SignalingMessage) -> Result<(), ConnectionError>;

    async fn close(&self);
}

/// 시그널링 채널 연결기. 수신 프레임은 `ConnectionEvent::Signal`로 전달된다.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn SignalingChannel>, ConnectionError>;
}
