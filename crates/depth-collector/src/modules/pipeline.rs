//! 수집 파이프라인 구성.
//!
//! 거래소 플릿 → 호가창 저장소 → 주기 집계 → 싱크 순서로 연결합니다.
//! rate limiter는 하나만 만들어 REST 클라이언트와 재동기화 워커가 공유합니다.

use depth_core::{Exchange, OrderBookStore, SinkConfig, TransportConfig};
use depth_exchange::{
    BinanceProtocol, BinanceRestClient, ChannelSink, ExchangeResult, FtxProtocol, JsonLinesSink,
    OkxProtocol, ResyncQueue, ResyncWorker, SinkBatch, SinkRegistry, TransportFleet,
    WeightedRateLimiter, WsConnector,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::symbol_discovery::discover_symbols;
use crate::{CollectorConfig, Result};

/// 거래소별 플릿.
pub enum ExchangeFleet {
    Binance(TransportFleet<BinanceProtocol>),
    Okx(TransportFleet<OkxProtocol>),
    Ftx(TransportFleet<FtxProtocol>),
}

macro_rules! with_fleet {
    ($self:expr, $fleet:ident => $body:expr) => {
        match $self {
            ExchangeFleet::Binance($fleet) => $body,
            ExchangeFleet::Okx($fleet) => $body,
            ExchangeFleet::Ftx($fleet) => $body,
        }
    };
}

impl ExchangeFleet {
    /// 거래소에 맞는 프로토콜로 플릿을 만듭니다.
    pub fn new(
        exchange: Exchange,
        config: TransportConfig,
        connector: Arc<dyn WsConnector>,
        store: Arc<OrderBookStore>,
        blacklist: &[String],
    ) -> Self {
        match exchange {
            Exchange::Binance => Self::Binance(
                TransportFleet::new(BinanceProtocol, config, connector, store)
                    .with_blacklist(blacklist),
            ),
            Exchange::Okx => Self::Okx(
                TransportFleet::new(OkxProtocol, config, connector, store).with_blacklist(blacklist),
            ),
            Exchange::Ftx => Self::Ftx(
                TransportFleet::new(FtxProtocol, config, connector, store).with_blacklist(blacklist),
            ),
        }
    }

    /// 시퀀스 끊김을 재동기화 큐로 보냅니다.
    pub fn with_resync(self, queue: ResyncQueue) -> Self {
        match self {
            Self::Binance(fleet) => Self::Binance(fleet.with_resync(queue)),
            Self::Okx(fleet) => Self::Okx(fleet.with_resync(queue)),
            Self::Ftx(fleet) => Self::Ftx(fleet.with_resync(queue)),
        }
    }

    pub fn exchange(&self) -> Exchange {
        with_fleet!(self, fleet => fleet.exchange())
    }

    pub async fn add_symbols(&self, symbols: &[String]) -> ExchangeResult<usize> {
        with_fleet!(self, fleet => fleet.add_symbols(symbols).await)
    }

    pub async fn start(&self, shutdown: CancellationToken) {
        with_fleet!(self, fleet => fleet.start(shutdown).await)
    }

    pub async fn shutdown(&self) {
        with_fleet!(self, fleet => fleet.shutdown().await)
    }

    pub async fn join(&self) -> ExchangeResult<()> {
        with_fleet!(self, fleet => fleet.join().await)
    }

    pub async fn symbol_count(&self) -> usize {
        with_fleet!(self, fleet => fleet.symbol_count().await)
    }

    pub async fn transport_count(&self) -> usize {
        with_fleet!(self, fleet => fleet.transport_count().await)
    }
}

/// 설정으로 싱크 목록을 만듭니다.
///
/// 모니터 채널은 항상 등록되며, 수신 측은 호출자가 소비해야 합니다.
pub fn build_sinks(config: &SinkConfig) -> (SinkRegistry, mpsc::Receiver<Arc<SinkBatch>>) {
    let mut sinks = SinkRegistry::new();
    if let Some(path) = &config.jsonl_path {
        sinks.register(Arc::new(JsonLinesSink::new(path)));
    }
    let (monitor, rx) = ChannelSink::channel("monitor", config.channel_capacity);
    sinks.register(Arc::new(monitor));
    (sinks, rx)
}

/// Binance가 활성화되어 있고 REST 주소가 있으면 클라이언트를 만듭니다.
pub fn binance_rest_client(
    config: &CollectorConfig,
    limiter: &Arc<WeightedRateLimiter>,
) -> Result<Option<Arc<BinanceRestClient>>> {
    let Some(endpoints) = config
        .app
        .exchanges
        .get(Exchange::Binance)
        .filter(|e| e.enabled && !e.rest_base_url.is_empty())
    else {
        return Ok(None);
    };
    let client = BinanceRestClient::new(endpoints.rest_base_url.as_str(), limiter.clone())?;
    Ok(Some(Arc::new(client)))
}

/// 플릿, 저장소, REST 클라이언트, 재동기화 워커 묶음.
pub struct Pipeline {
    store: Arc<OrderBookStore>,
    limiter: Arc<WeightedRateLimiter>,
    rest: Option<Arc<BinanceRestClient>>,
    fleets: Vec<ExchangeFleet>,
    resync: Option<ResyncWorker>,
    resync_task: Option<JoinHandle<ExchangeResult<()>>>,
}

impl Pipeline {
    /// 활성화된 거래소마다 심볼을 정하고 플릿에 배치합니다. 연결은 `start`에서 시작합니다.
    pub async fn build(
        config: &CollectorConfig,
        connector: Arc<dyn WsConnector>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let store = Arc::new(OrderBookStore::new());
        let limiter = Arc::new(WeightedRateLimiter::new(config.app.rate_limiter.clone()));
        let rest = binance_rest_client(config, &limiter)?;

        let (resync_queue, resync) = match (&rest, config.enable_resync) {
            (Some(rest), true) => {
                let (queue, rx) = ResyncQueue::channel();
                let worker = ResyncWorker::new(rest.clone(), store.clone(), queue.clone(), rx);
                (Some(queue), Some(worker))
            }
            _ => (None, None),
        };

        let mut fleets = Vec::new();
        for (exchange, endpoints) in config.app.exchanges.enabled() {
            let symbols =
                discover_symbols(exchange, endpoints, &config.discovery, rest.as_deref(), cancel)
                    .await?;

            let mut fleet = ExchangeFleet::new(
                exchange,
                config.app.transport.clone().with_base_url(&endpoints.ws_base_url),
                connector.clone(),
                store.clone(),
                &endpoints.blacklist,
            );
            if let (Exchange::Binance, Some(queue)) = (exchange, &resync_queue) {
                fleet = fleet.with_resync(queue.clone());
            }

            let added = fleet.add_symbols(&symbols).await?;
            tracing::info!(
                exchange = %exchange,
                symbols = added,
                transports = fleet.transport_count().await,
                "Fleet prepared"
            );
            fleets.push(fleet);
        }

        Ok(Self {
            store,
            limiter,
            rest,
            fleets,
            resync,
            resync_task: None,
        })
    }

    pub fn store(&self) -> &Arc<OrderBookStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<WeightedRateLimiter> {
        &self.limiter
    }

    pub fn rest(&self) -> Option<&Arc<BinanceRestClient>> {
        self.rest.as_ref()
    }

    pub fn fleets(&self) -> &[ExchangeFleet] {
        &self.fleets
    }

    /// 전체 심볼 수.
    pub async fn symbol_count(&self) -> usize {
        let mut total = 0;
        for fleet in &self.fleets {
            total += fleet.symbol_count().await;
        }
        total
    }

    /// 재동기화 워커와 모든 플릿의 수신 루프를 시작합니다.
    pub async fn start(&mut self, shutdown: CancellationToken) {
        if let Some(worker) = self.resync.take() {
            self.resync_task = Some(tokio::spawn(worker.run(shutdown.clone())));
        }
        for fleet in &self.fleets {
            fleet.start(shutdown.clone()).await;
        }
        tracing::info!(
            fleets = self.fleets.len(),
            symbols = self.symbol_count().await,
            "Pipeline started"
        );
    }

    /// 모든 연결을 닫고 작업이 끝날 때까지 기다립니다.
    ///
    /// 플릿 하나가 실패해도 나머지는 계속 정리하고 첫 에러를 반환합니다.
    pub async fn stop(mut self) -> Result<()> {
        let mut first_error = None;
        for fleet in &self.fleets {
            fleet.shutdown().await;
            if let Err(e) = fleet.join().await {
                tracing::error!(exchange = %fleet.exchange(), error = %e, "Fleet stopped with error");
                first_error.get_or_insert(e);
            }
        }

        if let Some(task) = self.resync_task.take() {
            task.abort();
            match task.await {
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Resync worker failed");
                    first_error.get_or_insert(e);
                }
                Ok(Ok(())) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!(error = %e, "Resync worker panicked"),
            }
        }

        tracing::info!("Pipeline stopped");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
