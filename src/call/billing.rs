//! 결제 측(초대자) 과금 엔진
//!
//! 연결이 `Connected`인 동안만 주기 타이머가 동작한다. 첫 시도는 선결제
//! 구간(180초) 뒤, 이후 60초마다 벽시계 기준으로 발생한다. 실패하면 즉시
//! 영상을 동결하고 5초 뒤 한 번 재시도하며, 재시도도 실패하면 3초 뒤 통화를
//! 끝낸다.
//!
//! 예약된 작업은 모두 epoch 토큰을 들고 있고 연결이 끊길 때마다 epoch가
//! 바뀌므로, 밀려난 타이머는 발화해도 아무 일도 하지 않는다. 결제 제출마다
//! 증가하는 `seq`로 늦게 도착한 결과를 구분한다. 늦은 실패도 실패 정책을
//! 그대로 타고, 늦은 성공은 더 새로운 결과가 없을 때만 상태를 바꾼다.

use super::connection::ConnectionState;
use super::media::VideoGate;
use super::payment::{Parties, PaymentGateway, PaymentReceipt};
use crate::config::BillingConfig;
use crate::error::PaymentError;
use crate::protocol::{now_millis, ChannelMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot, watch,
};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingState {
    Idle,
    Pending,
    Paid,
    Failed,
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Settled,
    SettledOnRetry,
}

/// 세션 동안 메모리에만 쌓이는 결제 기록
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub amount: f64,
    pub timestamp: u64,
    pub txid: String,
    pub outcome: PaymentOutcome,
}

/// 엔진 종료 시 반환값
#[derive(Debug, Clone, Default)]
pub struct BillingReport {
    pub records: Vec<PaymentRecord>,
    /// 재시도까지 실패해 통화를 끝낸 경우 마지막 결제 오류
    pub terminated: Option<PaymentError>,
}

impl BillingReport {
    pub fn total_paid(&self) -> f64 {
        self.records.iter().map(|r| r.amount).sum()
    }
}

#[derive(Debug)]
enum BillingEvent {
    Tick {
        epoch: u64,
    },
    RetryDue {
        epoch: u64,
    },
    Settled {
        epoch: u64,
        seq: u64,
        retry: bool,
        amount: f64,
        result: Result<PaymentReceipt, PaymentError>,
    },
    TerminateDue {
        epoch: u64,
    },
}

pub struct BillingEngine {
    config: BillingConfig,
    rate_per_minute: f64,
    parties: Parties,
    gateway: Arc<dyn PaymentGateway>,
    video: Arc<VideoGate>,
    outbox: UnboundedSender<ChannelMessage>,
    state: watch::Sender<BillingState>,
    events: UnboundedSender<BillingEvent>,
    records: Vec<PaymentRecord>,
    connected: bool,
    armed_before: bool,
    epoch: u64,
    /// 마지막으로 제출한 결제 번호
    seq: u64,
    /// 결과가 도착한 결제 중 가장 큰 번호
    last_settled: u64,
    /// 실패 후 재시도가 예약됐거나 진행 중이며 아직 성공하지 않음
    retry_outstanding: bool,
    terminating: Option<PaymentError>,
    tasks: Vec<AbortHandle>,
}

impl BillingEngine {
    /// 과금 엔진 생성 및 실행. 연결 상태는 읽기만 한다.
    pub fn spawn(
        config: BillingConfig,
        rate_per_minute: f64,
        parties: Parties,
        gateway: Arc<dyn PaymentGateway>,
        video: Arc<VideoGate>,
        outbox: UnboundedSender<ChannelMessage>,
        connection: watch::Receiver<ConnectionState>,
    ) -> BillingHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(BillingState::Idle);
        let (stop_tx, stop_rx) = oneshot::channel();

        let engine = Self {
            config,
            rate_per_minute,
            parties,
            gateway,
            video,
            outbox,
            state,
            events: events_tx,
            records: Vec::new(),
            connected: false,
            armed_before: false,
            epoch: 0,
            seq: 0,
            last_settled: 0,
            retry_outstanding: false,
            terminating: None,
            tasks: Vec::new(),
        };

        BillingHandle {
            task: tokio::spawn(engine.run(connection, events_rx, stop_rx)),
            stop: Some(stop_tx),
            state: state_rx,
            done: false,
        }
    }

    async fn run(
        mut self,
        mut connection: watch::Receiver<ConnectionState>,
        mut events: UnboundedReceiver<BillingEvent>,
        mut stop: oneshot::Receiver<()>,
    ) -> BillingReport {
        let initial = *connection.borrow_and_update();
        self.on_connection(initial);

        let terminated = loop {
            tokio::select! {
                _ = &mut stop => break None,
                changed = connection.changed() => match changed {
                    Ok(()) => {
                        let state = *connection.borrow_and_update();
                        self.on_connection(state);
                    }
                    Err(_) => break None,
                },
                Some(event) = events.recv() => {
                    if let Some(reason) = self.handle(event) {
                        break Some(reason);
                    }
                }
            }
        };

        self.disarm();
        if let Some(reason) = &terminated {
            tracing::info!(code = reason.code(), "Ending call after unrecovered payment failure");
        }
        BillingReport {
            records: std::mem::take(&mut self.records),
            terminated,
        }
    }

    fn on_connection(&mut self, state: ConnectionState) {
        let connected = state == ConnectionState::Connected;
        if connected == self.connected {
            return;
        }
        self.connected = connected;
        if connected {
            self.arm();
        } else {
            self.disarm();
            tracing::debug!(?state, "Billing disarmed");
        }
    }

    /// 첫 연결이면 선결제 구간 뒤, 재연결이면 한 주기 뒤 첫 시도
    fn arm(&mut self) {
        self.epoch += 1;
        let delay = if self.armed_before {
            self.config.interval
        } else {
            self.config.first_attempt_delay
        };
        self.armed_before = true;

        let epoch = self.epoch;
        let period = self.config.interval;
        let first = Instant::now() + delay;
        let tx = self.events.clone();
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(first, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if tx.send(BillingEvent::Tick { epoch }).is_err() {
                    break;
                }
            }
        });
        self.track(ticker.abort_handle());

        tracing::info!(
            first_attempt_secs = delay.as_secs(),
            interval_secs = period.as_secs(),
            rate = self.rate_per_minute,
            "Billing armed"
        );
    }

    fn disarm(&mut self) {
        self.epoch += 1;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.retry_outstanding = false;
        self.terminating = None;
    }

    fn handle(&mut self, event: BillingEvent) -> Option<PaymentError> {
        match event {
            BillingEvent::Tick { epoch } => {
                if epoch != self.epoch {
                    return None;
                }
                if self.terminating.is_some() {
                    tracing::debug!("Tick ignored, call is terminating");
                    return None;
                }
                // 동결 중에는 복구 전까지 Pending으로 보이지 않는다
                if !self.retry_outstanding {
                    self.set_state(BillingState::Pending);
                }
                self.begin_payment(false);
                None
            }
            BillingEvent::RetryDue { epoch } => {
                if epoch != self.epoch || self.terminating.is_some() || !self.retry_outstanding {
                    tracing::debug!("Superseded retry ignored");
                    return None;
                }
                self.begin_payment(true);
                None
            }
            BillingEvent::Settled {
                epoch,
                seq,
                retry,
                amount,
                result,
            } => {
                if epoch != self.epoch {
                    return None;
                }
                self.on_settled(seq, retry, amount, result);
                None
            }
            BillingEvent::TerminateDue { epoch } => {
                if epoch != self.epoch {
                    return None;
                }
                self.terminating.take()
            }
        }
    }

    fn begin_payment(&mut self, retry: bool) {
        let amount = self.rate_per_minute;
        self.emit(ChannelMessage::BillingAttempt {
            amount,
            timestamp: now_millis(),
            retry,
        });

        self.seq += 1;
        let (epoch, seq) = (self.epoch, self.seq);
        let gateway = self.gateway.clone();
        let parties = self.parties.clone();
        let tx = self.events.clone();
        let payment = tokio::spawn(async move {
            let result = gateway
                .submit_split_payment(&parties.payer, &parties.recipient, amount, &parties.platform)
                .await;
            let _ = tx.send(BillingEvent::Settled {
                epoch,
                seq,
                retry,
                amount,
                result,
            });
        });
        self.track(payment.abort_handle());

        tracing::debug!(seq, retry, amount, "Payment submitted");
    }

    fn on_settled(
        &mut self,
        seq: u64,
        retry: bool,
        amount: f64,
        result: Result<PaymentReceipt, PaymentError>,
    ) {
        let latest = seq > self.last_settled;
        self.last_settled = self.last_settled.max(seq);

        if self.terminating.is_some() {
            // 종료는 이미 정해졌다. 나간 돈만 기록한다.
            match result {
                Ok(receipt) => self.record(amount, receipt, retry),
                Err(e) => tracing::warn!(seq, code = e.code(), "Payment failed while terminating"),
            }
            return;
        }

        match result {
            Ok(receipt) => self.on_success(seq, amount, receipt, retry, latest),
            Err(e) => {
                if !latest {
                    tracing::warn!(
                        seq,
                        last_settled = self.last_settled,
                        "Superseded payment failed"
                    );
                }
                self.on_failure(seq, amount, e);
            }
        }
    }

    fn on_success(
        &mut self,
        seq: u64,
        amount: f64,
        receipt: PaymentReceipt,
        retry: bool,
        latest: bool,
    ) {
        let txid = receipt.txid.clone();
        self.record(amount, receipt, retry);
        if retry {
            self.retry_outstanding = false;
        }

        let timestamp = now_millis();
        self.emit(ChannelMessage::BillingSuccess {
            amount,
            txid: txid.clone(),
            timestamp,
            total: Some(self.total_paid()),
        });
        tracing::info!(seq, retry, txid = %txid, total = self.total_paid(), "Payment settled");

        // 실패한 분의 재시도가 남았거나 더 새로운 결과가 이미 있으면 기록만
        if self.retry_outstanding || !(latest || retry) {
            return;
        }
        self.set_state(BillingState::Paid);
        if self.video.is_frozen() && self.connected {
            self.video.unfreeze();
            self.emit(ChannelMessage::BillingUnfrozen { timestamp });
        }
    }

    /// 실패는 fail-closed: 복구 여부와 무관하게 먼저 동결한다
    fn on_failure(&mut self, seq: u64, amount: f64, error: PaymentError) {
        tracing::warn!(seq, code = error.code(), error = %error, "Payment failed");

        self.set_state(BillingState::Failed);
        let timestamp = now_millis();
        self.emit(ChannelMessage::BillingFailed {
            amount,
            code: error.code().to_string(),
            message: error.to_string(),
            timestamp,
        });
        if !self.video.is_frozen() && self.connected {
            self.video.freeze();
            self.emit(ChannelMessage::BillingFrozen {
                timestamp,
                reason: Some(error.code().to_string()),
            });
        }

        let epoch = self.epoch;
        if self.retry_outstanding {
            self.set_state(BillingState::Frozen);
            self.schedule(self.config.termination_delay, BillingEvent::TerminateDue { epoch });
            self.terminating = Some(error);
            tracing::info!(
                delay_secs = self.config.termination_delay.as_secs(),
                "Retry exhausted, scheduling termination"
            );
        } else {
            self.retry_outstanding = true;
            self.schedule(self.config.retry_delay, BillingEvent::RetryDue { epoch });
        }
    }

    fn record(&mut self, amount: f64, receipt: PaymentReceipt, retry: bool) {
        self.records.push(PaymentRecord {
            amount,
            timestamp: now_millis(),
            txid: receipt.txid,
            outcome: if retry {
                PaymentOutcome::SettledOnRetry
            } else {
                PaymentOutcome::Settled
            },
        });
    }

    fn total_paid(&self) -> f64 {
        self.records.iter().map(|r| r.amount).sum()
    }

    fn schedule(&mut self, delay: Duration, event: BillingEvent) {
        let tx = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        self.track(timer.abort_handle());
    }

    fn track(&mut self, handle: AbortHandle) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(handle);
    }

    fn emit(&self, message: ChannelMessage) {
        let _ = self.outbox.send(message);
    }

    fn set_state(&self, next: BillingState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Drop for BillingEngine {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// 실행 중인 과금 엔진 핸들
pub struct BillingHandle {
    task: JoinHandle<BillingReport>,
    stop: Option<oneshot::Sender<()>>,
    state: watch::Receiver<BillingState>,
    done: bool,
}

impl BillingHandle {
    pub fn state(&self) -> BillingState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BillingState> {
        self.state.clone()
    }

    /// 엔진이 스스로 끝날 때까지 대기 (결제 실패로 인한 종료)
    pub async fn finished(&mut self) -> BillingReport {
        if self.done {
            return BillingReport::default();
        }
        let report = match (&mut self.task).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Billing task ended abnormally");
                BillingReport::default()
            }
        };
        self.done = true;
        report
    }

    /// 모든 타이머와 진행 중인 결제를 취소하고 기록을 돌려받는다
    pub async fn stop(mut self) -> BillingReport {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.finished().await
    }
}
