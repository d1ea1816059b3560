//! 수신 메시지를 호가창 저장소와 구독 상태에 반영하는 핸들러.

use async_trait::async_trait;
use depth_core::{Clock, OrderBookStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::resync::ResyncQueue;
use crate::preparse::RoutingKey;
use crate::subscription::{Subscription, SubscriptionSet, SubscriptionState};
use crate::traits::{Decoded, ExchangeProtocol, ExchangeResult, FilterDecision, SubscriptionMode};
use crate::websocket::{FramedTransport, MessageHandler};
use crate::ExchangeError;

/// 전송 계층 하나에 붙는 호가 이벤트 핸들러.
pub struct BookEventHandler<P: ExchangeProtocol> {
    protocol: Arc<P>,
    base_url: String,
    store: Arc<OrderBookStore>,
    clock: Arc<dyn Clock>,
    resync: Option<ResyncQueue>,
    subscriptions: Mutex<SubscriptionSet>,
    /// 마지막 연결 URL에 들어간 구독 (`UrlRebuild`)
    connected_with: Mutex<Vec<Subscription>>,
}

impl<P: ExchangeProtocol> BookEventHandler<P> {
    pub fn new(
        protocol: Arc<P>,
        base_url: impl Into<String>,
        store: Arc<OrderBookStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            protocol,
            base_url: base_url.into(),
            store,
            clock,
            resync: None,
            subscriptions: Mutex::new(SubscriptionSet::new()),
            connected_with: Mutex::new(Vec::new()),
        }
    }

    /// 시퀀스 갭을 REST 스냅샷으로 메울 큐를 연결합니다.
    pub fn with_resync(mut self, queue: ResyncQueue) -> Self {
        self.resync = Some(queue);
        self
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscriptionSet> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 구독 상태 복사본.
    pub fn subscription_set(&self) -> SubscriptionSet {
        self.subscriptions().clone()
    }

    /// 유지 중인 구독 수 (대기 + 구독됨).
    pub fn active_count(&self) -> usize {
        let set = self.subscriptions();
        set.pending_count() + set.subscribed_count()
    }

    /// 대기 중이거나 구독된 상태인지 여부.
    pub fn is_active(&self, subscription: &Subscription) -> bool {
        matches!(
            self.subscriptions().get_state(subscription),
            SubscriptionState::Pending | SubscriptionState::Subscribed
        )
    }

    /// 구독 요청을 기록합니다. 새로 추가되었으면 `true`.
    pub fn track(&self, subscription: Subscription) -> bool {
        let now = self.clock.now();
        // 이미 구독된 항목은 에러가 아니라 "새로 추가되지 않음"
        self.subscriptions()
            .pending_subscription(subscription, now)
            .unwrap_or(false)
    }

    /// 구독 해제를 기록합니다. 추적 중이던 구독이면 `true`.
    pub fn untrack(&self, subscription: &Subscription) -> bool {
        let now = self.clock.now();
        let mut set = self.subscriptions();
        match self.protocol.subscription_mode() {
            SubscriptionMode::UrlRebuild => set.force_remove(subscription) > 0,
            SubscriptionMode::Incremental => set
                .unsubscribe(subscription.clone(), now, false)
                .unwrap_or(false),
        }
    }

    /// 해제 확인을 기다리지 않고 구독과 호가창을 지웁니다.
    pub fn forget(&self, subscription: &Subscription) -> bool {
        let removed = self.subscriptions().force_remove(subscription) > 0;
        self.store
            .remove(self.protocol.exchange(), &subscription.instrument);
        removed
    }

    /// 새 연결에 맞춰 구독 상태를 초기화하고 다시 보낼 구독을 반환합니다.
    ///
    /// 해제 확인을 받지 못한 구독은 호가창까지 제거합니다.
    pub fn reset_for_reconnect(&self) -> Vec<Subscription> {
        let now = self.clock.now();
        let reset = {
            let mut set = self.subscriptions();
            let reset = set.reset_all();
            for subscription in &reset.resend {
                let _ = set.pending_subscription(subscription.clone(), now);
            }
            reset
        };
        for subscription in &reset.dropped {
            debug!(subscription = %subscription, "Dropping unacknowledged unsubscribe");
            self.store
                .remove(self.protocol.exchange(), &subscription.instrument);
        }
        reset.resend
    }

    fn handle_decoded(&self, key: &str, decoded: Decoded) -> ExchangeResult<()> {
        match decoded {
            Decoded::Depth(update) => {
                let exchange = update.exchange;
                let outcome = self.store.apply(&update);
                if let Some(queue) = &self.resync {
                    let unsynced = self.store.is_synced(exchange, &update.symbol) == Some(false);
                    if outcome.needs_resync() || unsynced {
                        queue.request(exchange, &update.symbol);
                    }
                }
                Ok(())
            }
            Decoded::SubscribeAck(subscription) => {
                let now = self.clock.now();
                let mut set = self.subscriptions();
                match set.get_state(&subscription) {
                    SubscriptionState::Subscribed => {}
                    SubscriptionState::Pending => {
                        set.confirm_subscription(subscription, now, true)?;
                    }
                    state => {
                        // 요청 없이 온 확인도 구독됨으로 기록
                        warn!(subscription = %subscription, state = ?state, "Unexpected subscription ack");
                        set.confirm_subscription(subscription, now, false)?;
                    }
                }
                Ok(())
            }
            Decoded::UnsubscribeAck(subscription) => {
                if self.subscriptions().force_remove(&subscription) == 0 {
                    warn!(subscription = %subscription, "Unsubscribe ack for unknown subscription");
                }
                self.store
                    .remove(self.protocol.exchange(), &subscription.instrument);
                Ok(())
            }
            Decoded::Error { code, message } => {
                warn!(
                    exchange = %self.protocol.exchange(),
                    key = key,
                    code = %code,
                    message = %message,
                    "Exchange reported an error"
                );
                Err(ExchangeError::ApiError {
                    code: code.parse().unwrap_or(-1),
                    message,
                })
            }
            Decoded::Pong | Decoded::Ignored => Ok(()),
        }
    }
}

#[async_trait]
impl<P: ExchangeProtocol> MessageHandler for BookEventHandler<P> {
    fn connect_url(&self) -> String {
        let active = self.subscriptions().active();
        let url = self.protocol.build_url(&self.base_url, &active);
        *self.connected_with.lock().unwrap_or_else(|e| e.into_inner()) = active;
        url
    }

    fn classify(&self, bytes: &[u8], complete: bool) -> FilterDecision {
        self.protocol.classify(bytes, complete)
    }

    fn ping_frame(&self) -> Option<String> {
        self.protocol.ping_frame().map(str::to_string)
    }

    async fn on_connected(&self, transport: &FramedTransport) -> ExchangeResult<()> {
        let now = self.clock.now();

        match self.protocol.subscription_mode() {
            SubscriptionMode::UrlRebuild => {
                let in_url: HashSet<Subscription> = self
                    .connected_with
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .cloned()
                    .collect();
                let missing = {
                    let mut set = self.subscriptions();
                    for subscription in &in_url {
                        if set.get_state(subscription) == SubscriptionState::Pending {
                            let _ = set.confirm_subscription(subscription.clone(), now, true);
                        }
                    }
                    set.active().iter().filter(|s| !in_url.contains(*s)).count()
                };

                if missing > 0 {
                    return Err(ExchangeError::Subscription(format!(
                        "{} subscriptions were added while connecting",
                        missing
                    )));
                }
                info!(
                    transport = %transport.name(),
                    streams = in_url.len(),
                    "Combined stream connected"
                );
                Ok(())
            }
            SubscriptionMode::Incremental => {
                let frames = self.protocol.subscribe_frames(&self.reset_for_reconnect());

                debug!(
                    transport = %transport.name(),
                    frames = frames.len(),
                    "Re-sending subscriptions"
                );
                for frame in &frames {
                    transport.send_text(frame).await?;
                }
                Ok(())
            }
        }
    }

    async fn dispatch(
        &self,
        _transport: &FramedTransport,
        key: RoutingKey,
        payload: &[u8],
    ) -> ExchangeResult<()> {
        let decoded = self.protocol.decode(&key, payload)?;
        self.handle_decoded(&key, decoded)
    }
}

impl<P: ExchangeProtocol> std::fmt::Debug for BookEventHandler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookEventHandler")
            .field("exchange", &self.protocol.exchange())
            .field("base_url", &self.base_url)
            .field("active", &self.active_count())
            .finish()
    }
}
