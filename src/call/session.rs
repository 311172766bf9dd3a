//! 한 통화 세션
//!
//! 연결 관리자와 (초대자 측) 과금 엔진을 소유한다. 모든 상태는 세션 인스턴스
//! 필드에 있으므로 한 프로세스에서 여러 세션을 동시에 돌릴 수 있다.

use super::billing::{BillingEngine, BillingHandle, BillingReport, PaymentOutcome, PaymentRecord};
use super::connection::{ConnectionState, ManagerDeps, PeerConnectionManager};
use super::media::{MediaConstraints, MediaDevices, VideoGate};
use super::payment::{Parties, PaymentGateway, PaymentReceipt};
use super::room::{Capabilities, Role, Room};
use super::split::{prepayment_amount, split, PaymentSplit};
use super::transport::{ConnectionEvent, SignalingConnector, TransportFactory};
use crate::config::CallConfig;
use crate::error::{CallError, ConnectionError, PaymentError, ProtocolError, RoomError};
use crate::ice::IceResolver;
use crate::protocol::{now_millis, ChannelMessage};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;

/// 세션 외부 협력자
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub gateway: Arc<dyn PaymentGateway>,
}

/// 세션 관찰 이벤트
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    /// 상대방이 보낸 검증된 사이드 채널 메시지
    PeerMessage(ChannelMessage),
    /// 버려진 메시지. 세션은 계속된다.
    ProtocolDropped(ProtocolError),
    TipSent { amount: f64, txid: String },
    TipFailed { amount: f64, error: PaymentError },
    CapabilitiesChanged(Capabilities),
    /// 피어 연결 후의 기능 변경 시도
    CapabilitiesRejected(RoomError),
}

/// 통화 종료 사유
#[derive(Debug, Clone, PartialEq)]
pub enum CallEnd {
    HungUp,
    PaymentExhausted(PaymentError),
    ConnectionLost(ConnectionError),
}

/// 통화 종료 시 정산 요약
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub room_id: String,
    pub role: Role,
    pub end: CallEnd,
    pub payments: Vec<PaymentRecord>,
    pub tips: Vec<PaymentRecord>,
    pub prepaid: f64,
    pub recurring: f64,
    pub total: f64,
    pub split: PaymentSplit,
}

#[derive(Debug)]
enum Command {
    HangUp,
    Tip { amount: f64, message: Option<String> },
    SetCapabilities(Capabilities),
}

/// 실행 중인 세션 조작 핸들
#[derive(Debug, Clone)]
pub struct CallControl {
    tx: UnboundedSender<Command>,
}

impl CallControl {
    pub fn hang_up(&self) {
        let _ = self.tx.send(Command::HangUp);
    }

    /// 호스트에게 팁 결제 (초대자만)
    pub fn tip(&self, amount: f64) {
        self.tip_with_message(amount, None);
    }

    pub fn tip_with_message(&self, amount: f64, message: Option<String>) {
        let _ = self.tx.send(Command::Tip { amount, message });
    }

    /// 카메라/마이크/파일 구매 토글. 첫 연결 이후에는 거부된다.
    pub fn set_capabilities(&self, capabilities: Capabilities) {
        let _ = self.tx.send(Command::SetCapabilities(capabilities));
    }
}

struct TipOutcome {
    amount: f64,
    message: Option<String>,
    result: Result<PaymentReceipt, PaymentError>,
}

pub struct CallSession {
    room: Room,
    role: Role,
    manager: PeerConnectionManager,
    billing: Option<BillingHandle>,
    gateway: Arc<dyn PaymentGateway>,
    parties: Option<Parties>,
    events: UnboundedReceiver<ConnectionEvent>,
    inbound: UnboundedReceiver<ChannelMessage>,
    outbox: UnboundedReceiver<ChannelMessage>,
    commands_tx: UnboundedSender<Command>,
    commands: UnboundedReceiver<Command>,
    notify: UnboundedSender<SessionEvent>,
    tips_in_flight: JoinSet<TipOutcome>,
    payments: Vec<PaymentRecord>,
    tips: Vec<PaymentRecord>,
    peer_retry: bool,
}

impl CallSession {
    /// 시그널링 접속, 미디어 획득, 방 참여까지 마친 세션을 만든다.
    /// 초대자 측이면 과금 엔진도 함께 띄운다.
    pub async fn start(
        config: CallConfig,
        deps: SessionDeps,
        room: Room,
        role: Role,
        wallet: impl Into<String>,
        notify: UnboundedSender<SessionEvent>,
    ) -> Result<Self, CallError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let signaling = deps.signaling.connect(events_tx.clone()).await?;
        let video = VideoGate::new();
        let mut manager = PeerConnectionManager::new(
            config.connection.clone(),
            ManagerDeps {
                ice: IceResolver::new(config.ice.clone()),
                devices: deps.devices.clone(),
                transports: deps.transports.clone(),
                signaling,
            },
            events_tx,
            inbound_tx,
            video.clone(),
        );

        let caps = room.capabilities();
        let constraints = MediaConstraints {
            video: caps.camera,
            audio: caps.microphone,
        };
        if let Err(e) = manager.initialize(role, room.id(), constraints).await {
            tracing::warn!(room = %room.id(), error = %e, "Call setup failed");
            manager.cleanup().await;
            return Err(e);
        }

        let parties = (role == Role::Invitee).then(|| Parties {
            payer: wallet.into(),
            recipient: room.host_wallet().to_string(),
            platform: config.platform_wallet.clone(),
        });
        let billing = parties.as_ref().map(|parties| {
            BillingEngine::spawn(
                config.billing.clone(),
                room.rate_per_minute(),
                parties.clone(),
                deps.gateway.clone(),
                video,
                outbox_tx,
                manager.subscribe(),
            )
        });

        tracing::info!(
            room = %room.id(),
            role = role.as_str(),
            rate = room.rate_per_minute(),
            "Call session started"
        );

        Ok(Self {
            room,
            role,
            manager,
            billing,
            gateway: deps.gateway,
            parties,
            events,
            inbound,
            outbox,
            commands_tx,
            commands,
            notify,
            tips_in_flight: JoinSet::new(),
            payments: Vec::new(),
            tips: Vec::new(),
            peer_retry: false,
        })
    }

    pub fn control(&self) -> CallControl {
        CallControl {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// 통화가 끝날 때까지 구동하고 정리 후 요약을 돌려준다.
    pub async fn run(mut self) -> CallSummary {
        let mut connection = self.manager.subscribe();

        let end = loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    if let Err(e) = self.manager.dispatch(event).await {
                        if let Some(end) = self.on_error(e) {
                            break end;
                        }
                    }
                }
                Some(message) = self.outbox.recv() => {
                    self.manager.send_side_channel_message(&message);
                }
                Some(message) = self.inbound.recv() => {
                    self.on_peer_message(message);
                }
                Ok(()) = connection.changed() => {
                    let state = *connection.borrow_and_update();
                    if state == ConnectionState::Connected && !self.room.is_locked() {
                        self.room.lock();
                    }
                    self.emit(SessionEvent::ConnectionChanged(state));
                }
                report = wait_billing(&mut self.billing) => {
                    self.billing = None;
                    let terminated = report.terminated.clone();
                    self.payments.extend(report.records);
                    if let Some(reason) = terminated {
                        break CallEnd::PaymentExhausted(reason);
                    }
                }
                Some(joined) = self.tips_in_flight.join_next() => match joined {
                    Ok(outcome) => self.on_tip_settled(outcome),
                    Err(e) => tracing::warn!(error = %e, "Tip task ended abnormally"),
                },
                Some(command) = self.commands.recv() => match command {
                    Command::HangUp => break CallEnd::HungUp,
                    Command::Tip { amount, message } => self.start_tip(amount, message),
                    Command::SetCapabilities(caps) => self.set_capabilities(caps),
                },
            }
        };

        self.finish(end).await
    }

    async fn finish(mut self, end: CallEnd) -> CallSummary {
        if let Some(billing) = self.billing.take() {
            let report = billing.stop().await;
            self.payments.extend(report.records);
        }
        // 종료 직전에 쌓인 과금 알림까지 상대에게 보낸다
        while let Ok(message) = self.outbox.try_recv() {
            self.manager.send_side_channel_message(&message);
        }
        self.tips_in_flight.shutdown().await;
        self.manager.cleanup().await;

        let prepaid = prepayment_amount(self.room.rate_per_minute());
        let recurring: f64 = self.payments.iter().map(|p| p.amount).sum();
        let tipped: f64 = self.tips.iter().map(|p| p.amount).sum();
        let total = prepaid + recurring + tipped;

        tracing::info!(
            room = %self.room.id(),
            role = self.role.as_str(),
            end = ?end,
            payments = self.payments.len(),
            total,
            "Call ended"
        );

        CallSummary {
            room_id: self.room.id().to_string(),
            role: self.role,
            end,
            payments: self.payments,
            tips: self.tips,
            prepaid,
            recurring,
            total,
            split: split(total),
        }
    }

    fn on_error(&self, error: CallError) -> Option<CallEnd> {
        match error {
            CallError::Protocol(e) => {
                tracing::warn!(error = %e, "Dropped protocol message");
                self.emit(SessionEvent::ProtocolDropped(e));
                None
            }
            CallError::Connection(e) => {
                tracing::warn!(error = %e, "Connection unrecoverable");
                Some(CallEnd::ConnectionLost(e))
            }
            other => {
                tracing::warn!(error = %other, "Unexpected call error");
                None
            }
        }
    }

    /// 호스트 측은 상대의 결제 알림으로 받은 금액을 기록한다
    fn on_peer_message(&mut self, message: ChannelMessage) {
        match &message {
            ChannelMessage::BillingAttempt { retry, .. } => self.peer_retry = *retry,
            ChannelMessage::BillingSuccess {
                amount,
                txid,
                timestamp,
                ..
            } if self.role == Role::Host => {
                self.payments.push(PaymentRecord {
                    amount: *amount,
                    timestamp: *timestamp,
                    txid: txid.clone(),
                    outcome: if self.peer_retry {
                        PaymentOutcome::SettledOnRetry
                    } else {
                        PaymentOutcome::Settled
                    },
                });
            }
            ChannelMessage::Tip {
                amount,
                txid,
                timestamp,
                ..
            } if self.role == Role::Host => {
                tracing::info!(amount, txid = %txid, "Tip received");
                self.tips.push(PaymentRecord {
                    amount: *amount,
                    timestamp: *timestamp,
                    txid: txid.clone(),
                    outcome: PaymentOutcome::Settled,
                });
            }
            _ => {}
        }
        self.emit(SessionEvent::PeerMessage(message));
    }

    fn set_capabilities(&mut self, capabilities: Capabilities) {
        match self.room.set_capabilities(capabilities) {
            Ok(()) => {
                tracing::info!(room = %self.room.id(), ?capabilities, "Capabilities updated");
                self.emit(SessionEvent::CapabilitiesChanged(capabilities));
            }
            Err(e) => {
                tracing::warn!(room = %self.room.id(), error = %e, "Capability change rejected");
                self.emit(SessionEvent::CapabilitiesRejected(e));
            }
        }
    }

    fn start_tip(&mut self, amount: f64, message: Option<String>) {
        let Some(parties) = self.parties.clone() else {
            tracing::warn!("Host cannot send tips");
            return;
        };
        if !amount.is_finite() || amount <= 0.0 {
            tracing::warn!(amount, "Invalid tip amount");
            return;
        }

        let gateway = self.gateway.clone();
        self.tips_in_flight.spawn(async move {
            let result = gateway
                .submit_split_payment(&parties.payer, &parties.recipient, amount, &parties.platform)
                .await;
            TipOutcome {
                amount,
                message,
                result,
            }
        });
    }

    fn on_tip_settled(&mut self, outcome: TipOutcome) {
        let TipOutcome {
            amount,
            message,
            result,
        } = outcome;
        match result {
            Ok(receipt) => {
                let timestamp = now_millis();
                self.manager.send_side_channel_message(&ChannelMessage::Tip {
                    amount,
                    txid: receipt.txid.clone(),
                    timestamp,
                    message,
                });
                self.tips.push(PaymentRecord {
                    amount,
                    timestamp,
                    txid: receipt.txid.clone(),
                    outcome: PaymentOutcome::Settled,
                });
                tracing::info!(amount, txid = %receipt.txid, "Tip sent");
                self.emit(SessionEvent::TipSent {
                    amount,
                    txid: receipt.txid,
                });
            }
            Err(error) => {
                tracing::warn!(amount, code = error.code(), "Tip payment failed");
                self.emit(SessionEvent::TipFailed { amount, error });
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.notify.send(event);
    }
}

async fn wait_billing(billing: &mut Option<BillingHandle>) -> BillingReport {
    match billing {
        Some(handle) => handle.finished().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::billing::tests::ScriptedGateway;
    use crate::call::connection::tests::{FakeDevices, FakeFactory, FakeSignaling};
    use crate::call::transport::{SignalingChannel, TransportEvent, TransportState};
    use crate::error::MediaAcquisitionError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct FakeConnector {
        signaling: Arc<FakeSignaling>,
        events: Mutex<Option<UnboundedSender<ConnectionEvent>>>,
    }

    #[async_trait]
    impl SignalingConnector for FakeConnector {
        async fn connect(
            &self,
            events: UnboundedSender<ConnectionEvent>,
        ) -> Result<Arc<dyn SignalingChannel>, ConnectionError> {
            *self.events.lock() = Some(events);
            Ok(self.signaling.clone())
        }
    }

    struct Harness {
        connector: Arc<FakeConnector>,
        factory: Arc<FakeFactory>,
        gateway: Arc<ScriptedGateway>,
        control: CallControl,
        notify: UnboundedReceiver<SessionEvent>,
        room_id: String,
        task: JoinHandle<CallSummary>,
    }

    impl Harness {
        fn inject(&self, event: ConnectionEvent) {
            let events = self.connector.events.lock().clone().expect("not connected");
            events.send(event).expect("session gone");
        }

        fn signal(&self, text: String) {
            self.inject(ConnectionEvent::Signal(text));
        }

        fn transport(&self, generation: u64, event: TransportEvent) {
            self.inject(ConnectionEvent::Transport { generation, event });
        }

        /// 초대자 기준: offer 수신, 연결 완료, 사이드 채널 열림
        async fn connect_invitee(&self) {
            self.signal(format!(
                r#"{{"type":"offer","room":"{}","payload":{{"type":"offer","sdp":"o"}}}}"#,
                self.room_id
            ));
            self.transport(1, TransportEvent::StateChanged(TransportState::Connected));
            self.transport(1, TransportEvent::SideChannelOpen);
            settle().await;
        }

        async fn summary(&mut self) -> CallSummary {
            (&mut self.task).await.expect("session panicked")
        }

        fn side_channel_sends(&self) -> Vec<String> {
            self.factory
                .last()
                .entries()
                .into_iter()
                .filter_map(|e| e.strip_prefix("send:").map(str::to_string))
                .collect()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn start(role: Role, gateway: Arc<ScriptedGateway>) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let factory = Arc::new(FakeFactory::default());
        let deps = SessionDeps {
            devices: Arc::new(FakeDevices { fail: None }),
            transports: factory.clone(),
            signaling: connector.clone(),
            gateway: gateway.clone(),
        };
        let room = Room::new("host-wallet", 0.5, Capabilities::default()).unwrap();
        let room_id = room.id().to_string();
        let (notify_tx, notify) = mpsc::unbounded_channel();

        let session = CallSession::start(
            CallConfig::default(),
            deps,
            room,
            role,
            "invitee-wallet",
            notify_tx,
        )
        .await
        .unwrap();
        let control = session.control();

        Harness {
            connector,
            factory,
            gateway,
            control,
            notify,
            room_id,
            task: tokio::spawn(session.run()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invitee_pays_while_connected_and_summarises() {
        let mut h = start(Role::Invitee, ScriptedGateway::new(vec![])).await;
        h.connect_invitee().await;

        tokio::time::sleep(Duration::from_secs(181)).await;
        let sends = h.side_channel_sends();
        assert!(sends[0].contains(r#""type":"billing_attempt""#));
        assert!(sends[1].contains(r#""type":"billing_success""#));

        h.control.hang_up();
        let summary = h.summary().await;
        assert_eq!(summary.end, CallEnd::HungUp);
        assert_eq!(summary.role, Role::Invitee);
        assert_eq!(summary.payments.len(), 1);
        assert!((summary.prepaid - 1.5).abs() < 1e-9);
        assert!((summary.recurring - 0.5).abs() < 1e-9);
        assert!((summary.total - 2.0).abs() < 1e-9);
        assert_eq!(summary.split, split(2.0));
        assert_eq!(*h.connector.signaling.closes.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecovered_payment_ends_call() {
        let gateway = ScriptedGateway::new(vec![
            Err(PaymentError::InsufficientFunds),
            Err(PaymentError::InsufficientFunds),
        ]);
        let mut h = start(Role::Invitee, gateway).await;
        h.connect_invitee().await;

        let summary = h.summary().await;
        assert_eq!(summary.end, CallEnd::PaymentExhausted(PaymentError::InsufficientFunds));
        assert!(summary.payments.is_empty());
        assert!((summary.total - 1.5).abs() < 1e-9);

        let sends = h.side_channel_sends();
        assert!(sends.iter().any(|s| s.contains("billing_frozen")));
        assert_eq!(sends.iter().filter(|s| s.contains("billing_failed")).count(), 2);
        assert_eq!(h.gateway.call_times().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_restarts_end_call() {
        let mut h = start(Role::Invitee, ScriptedGateway::new(vec![])).await;
        h.connect_invitee().await;

        for generation in 1..=4 {
            h.transport(generation, TransportEvent::StateChanged(TransportState::Failed));
            settle().await;
        }

        let summary = h.summary().await;
        assert_eq!(
            summary.end,
            CallEnd::ConnectionLost(ConnectionError::RetriesExhausted { attempts: 3 })
        );
        assert_eq!(h.factory.count(), 4);
        assert!(h.gateway.call_times().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bad_signal_is_reported_not_fatal() {
        let mut h = start(Role::Host, ScriptedGateway::new(vec![])).await;
        h.signal("{oops".to_string());
        settle().await;

        let mut dropped = false;
        while let Ok(event) = h.notify.try_recv() {
            if matches!(event, SessionEvent::ProtocolDropped(ProtocolError::Malformed(_))) {
                dropped = true;
            }
        }
        assert!(dropped);

        h.control.hang_up();
        let summary = h.summary().await;
        assert_eq!(summary.end, CallEnd::HungUp);
    }

    #[tokio::test(start_paused = true)]
    async fn host_never_pays_and_records_peer_payments() {
        let mut h = start(Role::Host, ScriptedGateway::new(vec![])).await;
        h.signal(format!(r#"{{"type":"peer-joined","room":"{}"}}"#, h.room_id));
        h.transport(1, TransportEvent::StateChanged(TransportState::Connected));
        h.transport(
            1,
            TransportEvent::SideChannelMessage(
                r#"{"type":"billing_success","amount":0.5,"txid":"tx-9","timestamp":7}"#.into(),
            ),
        );
        h.transport(
            1,
            TransportEvent::SideChannelMessage(
                r#"{"type":"tip","amount":2.0,"txid":"tx-10","timestamp":8}"#.into(),
            ),
        );
        tokio::time::sleep(Duration::from_secs(400)).await;

        h.control.tip(1.0);
        h.control.hang_up();
        let summary = h.summary().await;
        assert!(h.gateway.call_times().is_empty());
        assert_eq!(summary.payments.len(), 1);
        assert_eq!(summary.payments[0].txid, "tx-9");
        assert_eq!(summary.tips.len(), 1);
        assert!((summary.total - 4.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn invitee_tip_is_paid_and_announced() {
        let mut h = start(Role::Invitee, ScriptedGateway::new(vec![])).await;
        h.connect_invitee().await;

        h.control.tip_with_message(1.0, Some("thanks".into()));
        settle().await;

        let sends = h.side_channel_sends();
        assert!(sends
            .iter()
            .any(|s| s.contains(r#""type":"tip""#) && s.contains("thanks")));
        let mut sent = false;
        while let Ok(event) = h.notify.try_recv() {
            if let SessionEvent::TipSent { amount, .. } = event {
                sent = amount == 1.0;
            }
        }
        assert!(sent);

        h.control.hang_up();
        let summary = h.summary().await;
        assert_eq!(summary.tips.len(), 1);
        assert!(summary.payments.is_empty());
        assert!((summary.total - 2.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn capabilities_lock_once_peer_connects() {
        let mut h = start(Role::Host, ScriptedGateway::new(vec![])).await;
        let camera_off = Capabilities {
            camera: false,
            ..Capabilities::default()
        };
        h.control.set_capabilities(camera_off);
        settle().await;

        h.signal(format!(r#"{{"type":"peer-joined","room":"{}"}}"#, h.room_id));
        h.transport(1, TransportEvent::StateChanged(TransportState::Connected));
        settle().await;
        h.control.set_capabilities(Capabilities::default());
        settle().await;

        let mut changed = Vec::new();
        let mut rejected = Vec::new();
        while let Ok(event) = h.notify.try_recv() {
            match event {
                SessionEvent::CapabilitiesChanged(caps) => changed.push(caps),
                SessionEvent::CapabilitiesRejected(e) => rejected.push(e),
                _ => {}
            }
        }
        assert_eq!(changed, vec![camera_off]);
        assert_eq!(rejected, vec![RoomError::CapabilitiesLocked]);

        h.control.hang_up();
        assert_eq!(h.summary().await.end, CallEnd::HungUp);
    }

    #[tokio::test]
    async fn media_failure_aborts_start() {
        let connector = Arc::new(FakeConnector::default());
        let deps = SessionDeps {
            devices: Arc::new(FakeDevices {
                fail: Some(MediaAcquisitionError::NoDevices),
            }),
            transports: Arc::new(FakeFactory::default()),
            signaling: connector.clone(),
            gateway: ScriptedGateway::new(vec![]),
        };
        let room = Room::new("host-wallet", 1.0, Capabilities::default()).unwrap();
        let (notify_tx, _notify) = mpsc::unbounded_channel();

        let result =
            CallSession::start(CallConfig::default(), deps, room, Role::Invitee, "w", notify_tx).await;
        assert!(matches!(
            result,
            Err(CallError::Media(MediaAcquisitionError::NoDevices))
        ));
        assert_eq!(*connector.signaling.closes.lock(), 1);
    }
}
