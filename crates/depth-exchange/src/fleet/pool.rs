//! 거래소별 전송 계층 묶음.
//!
//! 전송 계층 하나는 `max_stream_count_soft_limit`개까지 심볼을 받고, 모두 가득
//! 차면 플릿이 새 전송 계층을 만듭니다.

use depth_core::{Clock, Exchange, OrderBookStore, SystemClock, TransportConfig};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::BookEventHandler;
use super::resync::ResyncQueue;
use crate::traits::{ExchangeProtocol, ExchangeResult, SubscriptionMode};
use crate::websocket::{FramedTransport, WsConnector};
use crate::ExchangeError;

/// 프로토콜이 붙은 전송 계층 하나.
pub struct ExchangeTransport<P: ExchangeProtocol> {
    handler: Arc<BookEventHandler<P>>,
    transport: Arc<FramedTransport>,
    soft_limit: usize,
}

impl<P: ExchangeProtocol> ExchangeTransport<P> {
    pub fn new(
        name: impl Into<String>,
        config: TransportConfig,
        connector: Arc<dyn WsConnector>,
        handler: BookEventHandler<P>,
    ) -> Self {
        let soft_limit = config.max_stream_count_soft_limit.max(1);
        let handler = Arc::new(handler);
        let transport = Arc::new(FramedTransport::new(
            name,
            config,
            connector,
            handler.clone(),
        ));
        Self {
            handler,
            transport,
            soft_limit,
        }
    }

    pub fn transport(&self) -> &Arc<FramedTransport> {
        &self.transport
    }

    pub fn handler(&self) -> &Arc<BookEventHandler<P>> {
        &self.handler
    }

    /// 유지 중인 심볼 수.
    pub fn symbol_count(&self) -> usize {
        self.handler.active_count()
    }

    /// 더 받을 수 있는지 여부.
    pub fn has_capacity(&self) -> bool {
        self.symbol_count() < self.soft_limit
    }

    /// 심볼을 추가합니다. 한도를 넘으면 `Ok(false)`.
    ///
    /// `UrlRebuild`는 열린 연결을 닫아 다음 연결에서 URL을 다시 만들고,
    /// `Incremental`은 연결을 유지한 채 구독 프레임을 보냅니다.
    pub async fn add_symbol(&self, symbol: &str) -> ExchangeResult<bool> {
        let protocol = self.handler.protocol();
        let subscription = protocol.depth_subscription(symbol);
        if self.handler.is_active(&subscription) {
            return Ok(true);
        }
        if !self.has_capacity() {
            return Ok(false);
        }
        if !self.handler.track(subscription.clone()) {
            return Ok(true);
        }

        if self.transport.is_closed() {
            // 다음 연결에서 구독됨
            return Ok(true);
        }
        match protocol.subscription_mode() {
            SubscriptionMode::UrlRebuild => {
                debug!(transport = %self.transport.name(), symbol = symbol, "Reconnecting to add stream");
                self.transport.force_close().await;
            }
            SubscriptionMode::Incremental => {
                for frame in protocol.subscribe_frames(&[subscription]) {
                    if let Err(e) = self.transport.send_text(&frame).await {
                        // 재연결 시 다시 보냄
                        debug!(transport = %self.transport.name(), error = %e, "Subscribe frame not sent");
                        break;
                    }
                }
            }
        }
        Ok(true)
    }

    /// 심볼을 제거합니다. 추적 중이던 심볼이면 `true`.
    pub async fn remove_symbol(&self, symbol: &str, store: &OrderBookStore) -> bool {
        let protocol = self.handler.protocol();
        let subscription = protocol.depth_subscription(symbol);
        if !self.handler.untrack(&subscription) {
            return false;
        }

        match protocol.subscription_mode() {
            SubscriptionMode::UrlRebuild => {
                store.remove(protocol.exchange(), &subscription.instrument);
                if !self.transport.is_closed() {
                    self.transport.force_close().await;
                }
            }
            SubscriptionMode::Incremental => {
                if self.transport.is_closed() {
                    // 해제 확인이 올 연결이 없음
                    self.handler.forget(&subscription);
                    return true;
                }
                for frame in protocol.unsubscribe_frames(&[subscription]) {
                    if self.transport.send_text(&frame).await.is_err() {
                        // 재연결 시 reset_for_reconnect가 정리
                        break;
                    }
                }
            }
        }
        true
    }
}

/// 한 거래소의 전송 계층 묶음.
pub struct TransportFleet<P: ExchangeProtocol> {
    protocol: Arc<P>,
    config: TransportConfig,
    connector: Arc<dyn WsConnector>,
    store: Arc<OrderBookStore>,
    clock: Arc<dyn Clock>,
    resync: Option<ResyncQueue>,
    blacklist: HashSet<String>,
    transports: tokio::sync::Mutex<Vec<Arc<ExchangeTransport<P>>>>,
    tasks: Mutex<Vec<JoinHandle<ExchangeResult<()>>>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl<P: ExchangeProtocol> TransportFleet<P> {
    /// 새 플릿. `config.base_url`이 WebSocket 기본 URL입니다.
    pub fn new(
        protocol: P,
        config: TransportConfig,
        connector: Arc<dyn WsConnector>,
        store: Arc<OrderBookStore>,
    ) -> Self {
        Self {
            protocol: Arc::new(protocol),
            config,
            connector,
            store,
            clock: Arc::new(SystemClock),
            resync: None,
            blacklist: HashSet::new(),
            transports: tokio::sync::Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    /// 구독 시각 기록에 쓸 시계를 지정합니다.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 재동기화 큐를 연결합니다.
    pub fn with_resync(mut self, queue: ResyncQueue) -> Self {
        self.resync = Some(queue);
        self
    }

    /// 수집하지 않을 심볼.
    pub fn with_blacklist<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklist
            .extend(symbols.into_iter().map(|s| s.as_ref().to_uppercase()));
        self
    }

    pub fn exchange(&self) -> Exchange {
        self.protocol.exchange()
    }

    pub fn store(&self) -> &Arc<OrderBookStore> {
        &self.store
    }

    /// 블랙리스트에 있는지 여부.
    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.blacklist.contains(&symbol.to_uppercase())
    }

    fn new_transport(&self, index: usize) -> ExchangeTransport<P> {
        let mut handler = BookEventHandler::new(
            self.protocol.clone(),
            self.config.base_url.clone(),
            self.store.clone(),
            self.clock.clone(),
        );
        if let Some(queue) = &self.resync {
            handler = handler.with_resync(queue.clone());
        }
        ExchangeTransport::new(
            format!("{}-{}", self.exchange(), index),
            self.config.clone(),
            self.connector.clone(),
            handler,
        )
    }

    fn spawn(&self, transport: &Arc<ExchangeTransport<P>>) {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(shutdown) = shutdown else {
            return;
        };
        let framed = transport.transport().clone();
        let handle = tokio::spawn(async move { framed.run(shutdown).await });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// 심볼을 추가합니다. 블랙리스트에 있거나 이미 있으면 `Ok(false)`.
    ///
    /// 모든 전송 계층이 가득 찼으면 새 전송 계층을 만들고, 플릿이 시작된
    /// 상태라면 바로 수신 루프를 띄웁니다.
    pub async fn add_symbol(&self, symbol: &str) -> ExchangeResult<bool> {
        if self.is_blacklisted(symbol) {
            debug!(exchange = %self.exchange(), symbol = symbol, "Skipping blacklisted symbol");
            return Ok(false);
        }

        let mut transports = self.transports.lock().await;
        let subscription = self.protocol.depth_subscription(symbol);
        if transports
            .iter()
            .any(|t| t.handler().is_active(&subscription))
        {
            return Ok(false);
        }

        for transport in transports.iter() {
            if transport.add_symbol(symbol).await? {
                return Ok(true);
            }
        }

        let transport = Arc::new(self.new_transport(transports.len()));
        if !transport.add_symbol(symbol).await? {
            return Err(ExchangeError::Subscription(format!(
                "new transport refused {}",
                symbol
            )));
        }
        info!(
            exchange = %self.exchange(),
            transport = %transport.transport().name(),
            "Transport allocated"
        );
        self.spawn(&transport);
        transports.push(transport);
        Ok(true)
    }

    /// 여러 심볼을 추가합니다. 새로 추가된 수를 반환합니다.
    pub async fn add_symbols<I, S>(&self, symbols: I) -> ExchangeResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for symbol in symbols {
            if self.add_symbol(symbol.as_ref()).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// 심볼을 제거합니다.
    pub async fn remove_symbol(&self, symbol: &str) -> bool {
        let transports = self.transports.lock().await;
        for transport in transports.iter() {
            if transport.remove_symbol(symbol, &self.store).await {
                return true;
            }
        }
        false
    }

    /// 모든 전송 계층의 수신 루프를 띄웁니다. 이후 추가되는 전송 계층도 바로 뜹니다.
    pub async fn start(&self, shutdown: CancellationToken) {
        let transports = self.transports.lock().await;
        {
            let mut current = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_some() {
                warn!(exchange = %self.exchange(), "Fleet already started");
                return;
            }
            *current = Some(shutdown);
        }
        for transport in transports.iter() {
            self.spawn(transport);
        }
        info!(
            exchange = %self.exchange(),
            transports = transports.len(),
            symbols = transports.iter().map(|t| t.symbol_count()).sum::<usize>(),
            "Fleet started"
        );
    }

    /// 종료 토큰을 취소하고 모든 전송 계층을 해제합니다.
    pub async fn shutdown(&self) {
        if let Some(token) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            token.cancel();
        }
        let transports = self.transports.lock().await;
        for transport in transports.iter() {
            transport.transport().dispose().await;
        }
    }

    /// 모든 수신 루프가 끝날 때까지 기다립니다. 첫 에러를 반환합니다.
    pub async fn join(&self) -> ExchangeResult<()> {
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        let mut first_error = None;
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ExchangeError::Unknown(format!("receive loop panicked: {}", e))),
            };
            if let Err(e) = result {
                error!(exchange = %self.exchange(), error = %e, "Receive loop failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// 전송 계층 수.
    pub async fn transport_count(&self) -> usize {
        self.transports.lock().await.len()
    }

    /// 유지 중인 심볼 수.
    pub async fn symbol_count(&self) -> usize {
        self.transports
            .lock()
            .await
            .iter()
            .map(|t| t.symbol_count())
            .sum()
    }

    /// 유지 중인 심볼 (정렬됨).
    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .transports
            .lock()
            .await
            .iter()
            .flat_map(|t| t.handler().subscription_set().active())
            .map(|s| s.instrument)
            .collect();
        symbols.sort();
        symbols
    }

    /// 성공한 연결 수의 합.
    pub async fn connection_count(&self) -> u64 {
        self.transports
            .lock()
            .await
            .iter()
            .map(|t| t.transport().connection_counter())
            .sum()
    }
}

impl<P: ExchangeProtocol> std::fmt::Debug for TransportFleet<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFleet")
            .field("exchange", &self.exchange())
            .field("base_url", &self.config.base_url)
            .field("blacklist", &self.blacklist.len())
            .finish()
    }
}
