//! REST 스냅샷 재동기화.
//!
//! 시퀀스 갭이 생기거나 아직 스냅샷을 받지 못한 호가창은 큐에 한 번만 들어가고,
//! 워커가 rate limiter를 거쳐 스냅샷을 받아 저장소에 반영합니다.

use dashmap::DashSet;
use depth_core::{Exchange, OrderBookStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rest::BinanceRestClient;
use crate::traits::ExchangeResult;
use crate::ExchangeError;

/// 기본 스냅샷 깊이.
pub const DEFAULT_SNAPSHOT_LIMIT: u32 = 1000;

/// 재동기화 요청.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub exchange: Exchange,
    pub symbol: String,
}

/// 중복을 걸러내는 재동기화 큐.
#[derive(Debug, Clone)]
pub struct ResyncQueue {
    tx: mpsc::UnboundedSender<ResyncRequest>,
    pending: Arc<DashSet<(Exchange, String)>>,
}

impl ResyncQueue {
    /// 큐와 수신 측을 만듭니다.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResyncRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(DashSet::new()),
            },
            rx,
        )
    }

    /// 요청을 넣습니다. 이미 대기 중이면 `false`.
    pub fn request(&self, exchange: Exchange, symbol: &str) -> bool {
        if !self.pending.insert((exchange, symbol.to_string())) {
            return false;
        }
        debug!(exchange = %exchange, symbol = symbol, "Resync requested");
        let request = ResyncRequest {
            exchange,
            symbol: symbol.to_string(),
        };
        if self.tx.send(request).is_err() {
            self.pending.remove(&(exchange, symbol.to_string()));
            return false;
        }
        true
    }

    /// 처리 완료를 기록합니다. 같은 심볼을 다시 요청할 수 있게 됩니다.
    pub fn complete(&self, exchange: Exchange, symbol: &str) {
        self.pending.remove(&(exchange, symbol.to_string()));
    }

    /// 대기 중인 요청 수.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// REST 스냅샷으로 호가창을 다시 맞추는 워커 (Binance).
pub struct ResyncWorker {
    rest: Arc<BinanceRestClient>,
    store: Arc<OrderBookStore>,
    queue: ResyncQueue,
    rx: mpsc::UnboundedReceiver<ResyncRequest>,
    limit: u32,
}

impl ResyncWorker {
    pub fn new(
        rest: Arc<BinanceRestClient>,
        store: Arc<OrderBookStore>,
        queue: ResyncQueue,
        rx: mpsc::UnboundedReceiver<ResyncRequest>,
    ) -> Self {
        Self {
            rest,
            store,
            queue,
            rx,
            limit: DEFAULT_SNAPSHOT_LIMIT,
        }
    }

    /// 스냅샷 깊이를 지정합니다 (가중치가 달라집니다).
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// 종료 토큰이 취소되거나 큐가 닫힐 때까지 요청을 처리합니다.
    pub async fn run(mut self, shutdown: CancellationToken) -> ExchangeResult<()> {
        info!(limit = self.limit, "Resync worker started");
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match self.resync_one(&request, &shutdown).await {
                Ok(()) => {}
                Err(ExchangeError::Cancelled) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    exchange = %request.exchange,
                    symbol = %request.symbol,
                    error = %e,
                    "Resync failed"
                ),
            }
            // 실패했으면 다음 증분에서 다시 요청됨
            self.queue.complete(request.exchange, &request.symbol);
        }
        info!("Resync worker stopped");
        Ok(())
    }

    async fn resync_one(
        &self,
        request: &ResyncRequest,
        shutdown: &CancellationToken,
    ) -> ExchangeResult<()> {
        if request.exchange != Exchange::Binance {
            // OKX/FTX는 재구독 시 거래소가 스냅샷을 보냄
            warn!(exchange = %request.exchange, symbol = %request.symbol, "REST resync not available");
            return Ok(());
        }

        let snapshot = self
            .rest
            .depth_snapshot(&request.symbol, self.limit, shutdown)
            .await?;
        let outcome = self.store.apply(&snapshot);
        info!(
            exchange = %request.exchange,
            symbol = %request.symbol,
            last_update_id = ?snapshot.last_update_id,
            outcome = ?outcome,
            "Book resynced"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ResyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncWorker")
            .field("limit", &self.limit)
            .field("pending", &self.queue.pending_count())
            .finish()
    }
}
