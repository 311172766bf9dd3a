//! 피어 연결 관리자
//!
//! 시그널링 교환(offer/answer/trickle ICE)을 라이브 미디어 세션으로 만들고,
//! 이후 사이드 채널 메시지를 검증해 세션으로 넘긴다. 모든 입력은
//! [`PeerConnectionManager::dispatch`] 한 곳으로 들어온다.

use super::media::{MediaConstraints, MediaDevices, MediaStream, VideoGate};
use super::room::Role;
use super::transport::{
    ConnectionEvent, PeerTransport, SignalingChannel, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};
use crate::config::ConnectionConfig;
use crate::error::{CallError, ConnectionError, ProtocolError};
use crate::ice::IceResolver;
use crate::protocol::{
    parse_channel, parse_signaling, ChannelMessage, IceCandidate, IceServer, SessionDescription,
    SignalingMessage,
};
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, watch};

/// 연결 상태. 관리자만 변경하고 나머지는 watch로 관찰한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// 관리자가 쓰는 외부 협력자
#[derive(Clone)]
pub struct ManagerDeps {
    pub ice: IceResolver,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
}

#[derive(Debug, Clone)]
struct Binding {
    role: Role,
    room: String,
}

pub struct PeerConnectionManager {
    config: ConnectionConfig,
    deps: ManagerDeps,
    /// 전송 어댑터에 넘겨주는 이벤트 송신기
    events: UnboundedSender<ConnectionEvent>,
    /// 검증된 상대방 사이드 채널 메시지
    inbound: UnboundedSender<ChannelMessage>,
    state: watch::Sender<ConnectionState>,
    video: Arc<VideoGate>,
    binding: Option<Binding>,
    local: Option<MediaStream>,
    transport: Option<Arc<dyn PeerTransport>>,
    ice_servers: Vec<IceServer>,
    generation: u64,
    remote_described: bool,
    pending_candidates: Vec<IceCandidate>,
    channel_open: bool,
    peer_present: bool,
    restarts: u32,
    closed: bool,
}

impl PeerConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        deps: ManagerDeps,
        events: UnboundedSender<ConnectionEvent>,
        inbound: UnboundedSender<ChannelMessage>,
        video: Arc<VideoGate>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            deps,
            events,
            inbound,
            state,
            video,
            binding: None,
            local: None,
            transport: None,
            ice_servers: Vec::new(),
            generation: 0,
            remote_described: false,
            pending_candidates: Vec::new(),
            channel_open: false,
            peer_present: false,
            restarts: 0,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 읽기 전용 상태 구독
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn is_side_channel_open(&self) -> bool {
        self.channel_open
    }

    /// 로컬 미디어 획득, 연결 객체 생성, 방 참여.
    /// 호스트는 사이드 채널을 먼저 열고, 초대자는 호스트가 열 때까지 기다린다.
    pub async fn initialize(
        &mut self,
        role: Role,
        room: &str,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        if self.closed {
            return Err(ConnectionError::InvalidState("manager already cleaned up").into());
        }
        if self.binding.is_some() {
            return Err(ConnectionError::InvalidState("already initialized").into());
        }

        let stream = self.deps.devices.acquire(constraints).await?;
        self.video.attach_local(&stream);
        self.local = Some(stream);
        self.binding = Some(Binding {
            role,
            room: room.to_string(),
        });
        self.ice_servers = self.deps.ice.resolve().await;
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.build_transport().await {
            tracing::warn!(room = %room, error = %e, "Failed to create peer connection");
            self.set_state(ConnectionState::Failed);
            return Err(e.into());
        }

        self.deps.signaling.send(&SignalingMessage::Join {
            room: room.to_string(),
        })?;

        tracing::info!(
            role = role.as_str(),
            room = %room,
            ice_servers = self.ice_servers.len(),
            "Peer connection initialized"
        );
        Ok(())
    }

    /// 단일 진입점. `ProtocolError`는 메시지만 버리고 연결은 유지된다.
    pub async fn dispatch(&mut self, event: ConnectionEvent) -> Result<(), CallError> {
        if self.closed {
            tracing::trace!("Ignoring event after cleanup");
            return Ok(());
        }

        match event {
            ConnectionEvent::Signal(text) => self.on_signal(&text).await,
            ConnectionEvent::SignalingClosed => {
                tracing::debug!(state = ?self.state(), "Signaling socket closed");
                Ok(())
            }
            ConnectionEvent::Transport { generation, event } => {
                if generation != self.generation {
                    tracing::debug!(generation, current = self.generation, "Dropped stale transport event");
                    return Ok(());
                }
                self.on_transport(event).await
            }
        }
    }

    /// 사이드 채널이 열려 있지 않으면 경고만 남긴다.
    pub fn send_side_channel_message(&self, message: &ChannelMessage) {
        let Some(transport) = self.transport.as_ref().filter(|_| self.channel_open) else {
            tracing::warn!(kind = message.kind(), "Side channel not open, message dropped");
            return;
        };

        match serde_json::to_string(message) {
            Ok(text) => {
                if let Err(e) = transport.send_side_channel(text) {
                    tracing::warn!(kind = message.kind(), error = %e, "Side channel send failed");
                }
            }
            Err(e) => tracing::warn!(kind = message.kind(), error = %e, "Failed to encode side channel message"),
        }
    }

    /// 로컬 트랙 중지, 연결 객체와 시그널링 소켓 종료. 두 번 불러도 안전하다.
    pub async fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let stopped = self.local.as_ref().map(|s| s.stop_all()).unwrap_or(0);
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.deps.signaling.close().await;
        self.channel_open = false;
        self.pending_candidates.clear();
        self.set_state(ConnectionState::Disconnected);

        tracing::info!(stopped_tracks = stopped, "Peer connection cleaned up");
    }

    async fn on_signal(&mut self, text: &str) -> Result<(), CallError> {
        let message = parse_signaling(text)?;
        let Some(binding) = self.binding.clone() else {
            tracing::debug!(kind = message.kind(), "Signal before initialize ignored");
            return Ok(());
        };

        if message.room() != binding.room {
            return Err(ProtocolError::RoomMismatch {
                expected: binding.room,
                got: message.room().to_string(),
            }
            .into());
        }

        match (binding.role, message) {
            (Role::Host, SignalingMessage::PeerJoined { .. }) => {
                self.peer_present = true;
                if self.state() == ConnectionState::Connected {
                    tracing::debug!("Peer re-announced while connected");
                    return Ok(());
                }
                match self.send_offer().await {
                    Ok(()) => Ok(()),
                    Err(e) => self.recover(e).await,
                }
            }
            (Role::Invitee, SignalingMessage::PeerJoined { .. }) => {
                self.peer_present = true;
                Ok(())
            }
            (Role::Invitee, SignalingMessage::Offer { payload, .. }) => {
                self.peer_present = true;
                match self.answer_offer(payload).await {
                    Ok(()) => Ok(()),
                    Err(e) => self.recover(e).await,
                }
            }
            (Role::Host, SignalingMessage::Answer { payload, .. }) => {
                match self.apply_remote(payload).await {
                    Ok(()) => Ok(()),
                    Err(e) => self.recover(e).await,
                }
            }
            (_, SignalingMessage::Candidate { payload, .. }) => {
                self.apply_candidate(payload).await;
                Ok(())
            }
            (role, message) => Err(ProtocolError::RoleMismatch {
                kind: message.kind(),
                role: role.as_str(),
            }
            .into()),
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) -> Result<(), CallError> {
        match event {
            TransportEvent::StateChanged(TransportState::Connected) => {
                if self.state() == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(generation = self.generation, "Peer connection established");
                }
                Ok(())
            }
            TransportEvent::StateChanged(state) => {
                if matches!(
                    self.state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    tracing::warn!(?state, "Peer connection lost");
                    self.restart_or_fail().await
                } else {
                    Ok(())
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                let Some(binding) = self.binding.as_ref() else {
                    return Ok(());
                };
                self.deps.signaling.send(&SignalingMessage::Candidate {
                    room: binding.room.clone(),
                    payload: candidate,
                })?;
                Ok(())
            }
            TransportEvent::SideChannelOpen => {
                self.channel_open = true;
                tracing::info!("Side channel open");
                Ok(())
            }
            TransportEvent::SideChannelClosed => {
                self.channel_open = false;
                tracing::debug!("Side channel closed");
                Ok(())
            }
            TransportEvent::SideChannelMessage(text) => {
                let message = parse_channel(&text)?;
                tracing::debug!(kind = message.kind(), "Side channel message received");
                let _ = self.inbound.send(message);
                Ok(())
            }
            TransportEvent::RemoteTrack(track) => {
                tracing::debug!(track = %track.id(), kind = ?track.kind(), "Remote track attached");
                self.video.attach_remote(track);
                Ok(())
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!(from = ?*current, to = ?next, "Connection state changed");
                *current = next;
                true
            }
        });
    }

    fn is_host(&self) -> bool {
        matches!(self.binding, Some(Binding { role: Role::Host, .. }))
    }

    fn current_transport(&self) -> Result<Arc<dyn PeerTransport>, ConnectionError> {
        self.transport
            .clone()
            .ok_or(ConnectionError::InvalidState("no peer connection"))
    }

    async fn build_transport(&mut self) -> Result<(), ConnectionError> {
        self.generation += 1;
        self.remote_described = false;
        self.pending_candidates.clear();
        self.channel_open = false;

        let events = TransportEvents::new(self.generation, self.events.clone());
        let transport = self.deps.transports.create(&self.ice_servers, events).await?;

        if let Some(local) = &self.local {
            for track in local.tracks() {
                transport.add_track(track.clone())?;
            }
        }
        if self.is_host() {
            transport.open_side_channel(&self.config.side_channel_label)?;
        }

        self.transport = Some(transport);
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), ConnectionError> {
        let Some(room) = self.binding.as_ref().map(|b| b.room.clone()) else {
            return Err(ConnectionError::InvalidState("not initialized"));
        };
        let offer = self.current_transport()?.create_offer().await?;
        self.deps
            .signaling
            .send(&SignalingMessage::Offer { room, payload: offer })?;
        tracing::debug!("Offer sent");
        Ok(())
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), ConnectionError> {
        let Some(room) = self.binding.as_ref().map(|b| b.room.clone()) else {
            return Err(ConnectionError::InvalidState("not initialized"));
        };
        self.apply_remote(offer).await?;
        let answer = self.current_transport()?.create_answer().await?;
        self.deps.signaling.send(&SignalingMessage::Answer {
            room,
            payload: answer,
        })?;
        tracing::debug!("Answer sent");
        Ok(())
    }

    /// 원격 디스크립션 적용 후 대기 중인 후보를 도착 순서대로 반영
    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let transport = self.current_transport()?;
        transport.set_remote_description(desc).await?;
        self.remote_described = true;

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Flushing buffered ICE candidates");
        }
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Buffered ICE candidate rejected");
            }
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_described {
            self.pending_candidates.push(candidate);
            return;
        }
        let Ok(transport) = self.current_transport() else {
            return;
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "ICE candidate rejected");
        }
    }

    /// 협상 중 전송 오류. 시그널링 오류는 재시작으로 복구되지 않는다.
    async fn recover(&mut self, error: ConnectionError) -> Result<(), CallError> {
        match error {
            ConnectionError::Signaling(_) => Err(error.into()),
            other => {
                tracing::warn!(error = %other, "Negotiation failed");
                self.restart_or_fail().await
            }
        }
    }

    /// 같은 로컬 미디어와 방으로 연결 객체를 다시 만든다. 세션당 최대
    /// `max_restarts`회이며 초과하면 `Failed`에 머문다.
    async fn restart_or_fail(&mut self) -> Result<(), CallError> {
        loop {
            self.set_state(ConnectionState::Failed);
            if let Some(old) = self.transport.take() {
                old.close().await;
            }

            if self.restarts >= self.config.max_restarts {
                tracing::warn!(attempts = self.restarts, "Peer connection restarts exhausted");
                return Err(ConnectionError::RetriesExhausted {
                    attempts: self.restarts,
                }
                .into());
            }
            self.restarts += 1;
            tracing::info!(attempt = self.restarts, "Restarting peer connection");

            if let Err(e) = self.build_transport().await {
                tracing::warn!(error = %e, "Peer connection restart failed");
                continue;
            }
            self.set_state(ConnectionState::Connecting);

            if self.is_host() && self.peer_present {
                match self.send_offer().await {
                    Ok(()) => {}
                    Err(e @ ConnectionError::Signaling(_)) => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Re-offer failed");
                        continue;
                    }
                }
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::call::media::{MediaTrack, TrackKind};
    use crate::config::IceConfig;
    use crate::error::MediaAcquisitionError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    pub(crate) struct FakeDevices {
        pub fail: Option<MediaAcquisitionError>,
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn acquire(
            &self,
            constraints: MediaConstraints,
        ) -> Result<MediaStream, MediaAcquisitionError> {
            if let Some(e) = &self.fail {
                return Err(e.clone());
            }
            let mut tracks = Vec::new();
            if constraints.video {
                tracks.push(MediaTrack::new("local-cam", TrackKind::Video));
            }
            if constraints.audio {
                tracks.push(MediaTrack::new("local-mic", TrackKind::Audio));
            }
            Ok(MediaStream::new(tracks))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub log: Mutex<Vec<String>>,
        pub fail_remote: bool,
    }

    impl FakeTransport {
        pub fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn push(&self, entry: impl Into<String>) {
            self.log.lock().push(entry.into());
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), ConnectionError> {
            self.push(format!("track:{}", track.id()));
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
            self.push("offer");
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
            self.push("answer");
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
            if self.fail_remote {
                return Err(ConnectionError::Transport("bad sdp".into()));
            }
            self.push(format!("remote:{}", desc.sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
            self.push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        fn open_side_channel(&self, label: &str) -> Result<(), ConnectionError> {
            self.push(format!("open:{}", label));
            Ok(())
        }

        fn send_side_channel(&self, text: String) -> Result<(), ConnectionError> {
            self.push(format!("send:{}", text));
            Ok(())
        }

        async fn close(&self) {
            self.push("close");
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeFactory {
        pub created: Mutex<Vec<Arc<FakeTransport>>>,
    }

    impl FakeFactory {
        pub fn last(&self) -> Arc<FakeTransport> {
            self.created.lock().last().cloned().expect("no transport created")
        }

        pub fn count(&self) -> usize {
            self.created.lock().len()
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(
            &self,
            _ice_servers: &[IceServer],
            _events: TransportEvents,
        ) -> Result<Arc<dyn PeerTransport>, ConnectionError> {
            let transport = Arc::new(FakeTransport::default());
            self.created.lock().push(transport.clone());
            Ok(transport)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSignaling {
        pub sent: Mutex<Vec<SignalingMessage>>,
        pub closes: Mutex<u32>,
    }

    #[async_trait]
    impl SignalingChannel for FakeSignaling {
        fn send(&self, message: &SignalingMessage) -> Result<(), ConnectionError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn close(&self) {
            *self.closes.lock() += 1;
        }
    }

    pub(crate) const AV: MediaConstraints = MediaConstraints {
        video: true,
        audio: true,
    };

    struct Harness {
        manager: PeerConnectionManager,
        factory: Arc<FakeFactory>,
        signaling: Arc<FakeSignaling>,
        inbound: UnboundedReceiver<ChannelMessage>,
        _events: UnboundedReceiver<ConnectionEvent>,
    }

    fn harness(devices: FakeDevices) -> Harness {
        let factory = Arc::new(FakeFactory::default());
        let signaling = Arc::new(FakeSignaling::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let deps = ManagerDeps {
            ice: IceResolver::new(IceConfig::default()),
            devices: Arc::new(devices),
            transports: factory.clone(),
            signaling: signaling.clone(),
        };
        Harness {
            manager: PeerConnectionManager::new(
                ConnectionConfig::default(),
                deps,
                events_tx,
                inbound_tx,
                VideoGate::new(),
            ),
            factory,
            signaling,
            inbound: inbound_rx,
            _events: events_rx,
        }
    }

    fn ok_devices() -> FakeDevices {
        FakeDevices { fail: None }
    }

    fn signal(text: &str) -> ConnectionEvent {
        ConnectionEvent::Signal(text.to_string())
    }

    fn transport_event(generation: u64, event: TransportEvent) -> ConnectionEvent {
        ConnectionEvent::Transport { generation, event }
    }

    const OFFER: &str = r#"{"type":"offer","room":"r1","payload":{"type":"offer","sdp":"remote offer"}}"#;
    const ANSWER: &str = r#"{"type":"answer","room":"r1","payload":{"type":"answer","sdp":"remote answer"}}"#;
    const PEER_JOINED: &str = r#"{"type":"peer-joined","room":"r1"}"#;

    fn candidate(c: &str) -> String {
        format!(r#"{{"type":"candidate","room":"r1","payload":{{"candidate":"{c}","sdpMLineIndex":0,"sdpMid":"0"}}}}"#)
    }

    #[tokio::test]
    async fn host_opens_side_channel_and_offers_on_peer_join() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);

        h.manager.dispatch(signal(PEER_JOINED)).await.unwrap();

        let log = h.factory.last().entries();
        assert_eq!(log, vec!["track:local-cam", "track:local-mic", "open:paycall", "offer"]);
        let sent = h.signaling.sent.lock().clone();
        assert_eq!(sent[0], SignalingMessage::Join { room: "r1".into() });
        assert!(matches!(&sent[1], SignalingMessage::Offer { room, .. } if room == "r1"));
    }

    #[tokio::test]
    async fn invitee_buffers_candidates_until_offer_arrives() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Invitee, "r1", AV).await.unwrap();

        h.manager.dispatch(signal(&candidate("c1"))).await.unwrap();
        h.manager.dispatch(signal(&candidate("c2"))).await.unwrap();
        h.manager.dispatch(signal(OFFER)).await.unwrap();
        h.manager.dispatch(signal(&candidate("c3"))).await.unwrap();

        let log = h.factory.last().entries();
        assert!(!log.iter().any(|e| e.starts_with("open:")));
        assert_eq!(
            &log[2..],
            &["remote:remote offer", "candidate:c1", "candidate:c2", "answer", "candidate:c3"]
        );
        assert!(matches!(
            h.signaling.sent.lock().last(),
            Some(SignalingMessage::Answer { .. })
        ));
    }

    #[tokio::test]
    async fn host_applies_answer() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();
        h.manager.dispatch(signal(PEER_JOINED)).await.unwrap();
        h.manager.dispatch(signal(ANSWER)).await.unwrap();
        assert!(h.factory.last().entries().contains(&"remote:remote answer".to_string()));
    }

    #[tokio::test]
    async fn bad_messages_are_dropped_without_teardown() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Invitee, "r1", AV).await.unwrap();

        let err = h.manager.dispatch(signal("{not json")).await.unwrap_err();
        assert!(matches!(err, CallError::Protocol(ProtocolError::Malformed(_))));

        let err = h.manager.dispatch(signal(ANSWER)).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Protocol(ProtocolError::RoleMismatch { kind: "answer", role: "invitee" })
        ));

        let other_room = OFFER.replace("\"r1\"", "\"r2\"");
        let err = h.manager.dispatch(signal(&other_room)).await.unwrap_err();
        assert!(matches!(err, CallError::Protocol(ProtocolError::RoomMismatch { .. })));

        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        h.manager.dispatch(signal(OFFER)).await.unwrap();
        assert_eq!(h.factory.count(), 1);
    }

    #[tokio::test]
    async fn media_failure_is_fatal_to_initialize() {
        let mut h = harness(FakeDevices {
            fail: Some(MediaAcquisitionError::PermissionDenied),
        });
        let err = h.manager.initialize(Role::Invitee, "r1", AV).await.unwrap_err();
        assert!(matches!(err, CallError::Media(MediaAcquisitionError::PermissionDenied)));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.factory.count(), 0);
        assert!(h.signaling.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn transport_connected_moves_to_connected() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();
        h.manager
            .dispatch(transport_event(1, TransportEvent::StateChanged(TransportState::Connected)))
            .await
            .unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn cleanup_twice_matches_cleanup_once() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();
        h.manager
            .dispatch(transport_event(1, TransportEvent::StateChanged(TransportState::Connected)))
            .await
            .unwrap();
        let mut observer = h.manager.subscribe();
        observer.borrow_and_update();

        h.manager.cleanup().await;
        assert!(observer.has_changed().unwrap());
        assert_eq!(*observer.borrow_and_update(), ConnectionState::Disconnected);

        h.manager.cleanup().await;
        assert!(!observer.has_changed().unwrap());
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(*h.signaling.closes.lock(), 1);
        let closes = h
            .factory
            .last()
            .entries()
            .iter()
            .filter(|e| *e == "close")
            .count();
        assert_eq!(closes, 1);

        // 정리 이후의 이벤트는 무시된다
        h.manager
            .dispatch(transport_event(1, TransportEvent::StateChanged(TransportState::Connected)))
            .await
            .unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(h.manager.initialize(Role::Host, "r1", AV).await.is_err());
    }

    #[tokio::test]
    async fn restarts_are_bounded() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();
        h.manager.dispatch(signal(PEER_JOINED)).await.unwrap();

        for generation in 1..=3u64 {
            h.manager
                .dispatch(transport_event(generation, TransportEvent::StateChanged(TransportState::Failed)))
                .await
                .unwrap();
            assert_eq!(h.manager.state(), ConnectionState::Connecting);
            // 호스트는 새 연결 객체로 다시 offer를 보낸다
            assert!(h.factory.last().entries().contains(&"offer".to_string()));
        }
        assert_eq!(h.manager.restarts(), 3);

        let err = h
            .manager
            .dispatch(transport_event(4, TransportEvent::StateChanged(TransportState::Closed)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Connection(ConnectionError::RetriesExhausted { attempts: 3 })
        ));
        assert_eq!(h.manager.state(), ConnectionState::Failed);
        assert_eq!(h.factory.count(), 4);
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Invitee, "r1", AV).await.unwrap();
        h.manager
            .dispatch(transport_event(1, TransportEvent::StateChanged(TransportState::Failed)))
            .await
            .unwrap();

        h.manager
            .dispatch(transport_event(1, TransportEvent::StateChanged(TransportState::Connected)))
            .await
            .unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);

        h.manager
            .dispatch(transport_event(2, TransportEvent::StateChanged(TransportState::Connected)))
            .await
            .unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn side_channel_send_requires_open_channel() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();
        let msg = ChannelMessage::BillingUnfrozen { timestamp: 1 };

        h.manager.send_side_channel_message(&msg);
        assert!(!h.factory.last().entries().iter().any(|e| e.starts_with("send:")));

        h.manager
            .dispatch(transport_event(1, TransportEvent::SideChannelOpen))
            .await
            .unwrap();
        h.manager.send_side_channel_message(&msg);
        assert!(h
            .factory
            .last()
            .entries()
            .contains(&r#"send:{"type":"billing_unfrozen","timestamp":1}"#.to_string()));
    }

    #[tokio::test]
    async fn inbound_side_channel_messages_are_validated() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();

        let ok = r#"{"type":"billing_attempt","amount":0.5,"timestamp":1}"#;
        h.manager
            .dispatch(transport_event(1, TransportEvent::SideChannelMessage(ok.into())))
            .await
            .unwrap();
        assert_eq!(h.inbound.try_recv().unwrap().kind(), "billing_attempt");

        let bad = r#"{"type":"billing_success","amount":0.5,"timestamp":1}"#;
        let err = h
            .manager
            .dispatch(transport_event(1, TransportEvent::SideChannelMessage(bad.into())))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Protocol(_)));
        assert!(h.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_candidates_are_relayed() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Invitee, "r1", AV).await.unwrap();
        let c = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        };
        h.manager
            .dispatch(transport_event(1, TransportEvent::LocalCandidate(c.clone())))
            .await
            .unwrap();
        assert_eq!(
            h.signaling.sent.lock().last(),
            Some(&SignalingMessage::Candidate {
                room: "r1".into(),
                payload: c
            })
        );
    }

    #[tokio::test]
    async fn remote_sdp_failure_triggers_restart() {
        let mut h = harness(ok_devices());
        h.manager.initialize(Role::Host, "r1", AV).await.unwrap();
        h.manager.dispatch(signal(PEER_JOINED)).await.unwrap();

        // 첫 연결 객체를 원격 SDP 실패로 교체
        let failing: Arc<dyn PeerTransport> = Arc::new(FakeTransport {
            fail_remote: true,
            ..FakeTransport::default()
        });
        h.manager.transport = Some(failing);

        h.manager.dispatch(signal(ANSWER)).await.unwrap();
        assert_eq!(h.manager.restarts(), 1);
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
    }
}
