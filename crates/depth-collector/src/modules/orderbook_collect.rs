//! 호가 집계 주기 모듈.
//!
//! 주기마다 저장소의 호가창을 떠내 top-K 행으로 줄이고 싱크에 전달합니다.
//! 모든 싱크가 실패한 경우에만 같은 배치를 다시 보냅니다.

use depth_core::{AggregatorConfig, Clock, OrderBookStore, OrderbookAggregator, SystemClock};
use depth_exchange::{with_retry, DispatchReport, ExchangeError, RetryConfig, SinkBatch, SinkRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{CollectionStats, CollectorError, Result};

/// 한 주기의 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    /// 집계한 호가창 수
    pub rows: usize,
    /// 싱크 전달 결과
    pub report: DispatchReport,
}

/// 주기 집계기.
pub struct OrderbookCollector {
    store: Arc<OrderBookStore>,
    aggregator: OrderbookAggregator,
    sinks: SinkRegistry,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
}

impl OrderbookCollector {
    /// 새 집계기. 재시도 deadline은 집계 주기와 같습니다.
    pub fn new(store: Arc<OrderBookStore>, sinks: SinkRegistry, config: &AggregatorConfig) -> Self {
        Self {
            store,
            aggregator: OrderbookAggregator::from_seed_option(config.size, config.seed),
            sinks,
            clock: Arc::new(SystemClock),
            retry: RetryConfig::new(config.max_retries, Duration::from_millis(config.interval_ms)),
        }
    }

    /// 배치 시각에 쓸 시계를 지정합니다.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sinks(&self) -> &SinkRegistry {
        &self.sinks
    }

    /// 갱신된 호가창을 모두 집계합니다. 호가창 통계는 초기화됩니다.
    pub fn aggregate(&mut self) -> SinkBatch {
        let rows = self
            .store
            .drain_snapshots()
            .iter()
            .map(|snapshot| self.aggregator.aggregate_book(snapshot))
            .collect();
        SinkBatch::new(self.clock.now(), rows)
    }

    /// 한 주기를 실행합니다. 갱신된 호가창이 없으면 `None`.
    pub async fn collect_once(&mut self, cancel: &CancellationToken) -> Result<Option<CycleOutcome>> {
        let batch = self.aggregate();
        if batch.is_empty() {
            tracing::debug!("No updated books, skipping dispatch");
            return Ok(None);
        }

        let sinks = &self.sinks;
        let rows = batch.len();
        let report = with_retry(&self.retry, "orderbook_dispatch", |attempt| {
            let batch = batch.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(ExchangeError::Cancelled);
                }
                let report = sinks.dispatch(batch, cancel).await;
                if report.delivered == 0 && report.failed > 0 {
                    return Err(ExchangeError::Unknown(format!(
                        "all {} sinks failed (attempt {})",
                        report.failed, attempt
                    )));
                }
                Ok(report)
            }
        })
        .await?;

        tracing::debug!(
            rows = rows,
            delivered = report.delivered,
            failed = report.failed,
            "Aggregation cycle finished"
        );
        Ok(Some(CycleOutcome { rows, report }))
    }

    /// 종료 토큰이 취소될 때까지 `interval`마다 집계합니다.
    pub async fn run_periodic(
        &mut self,
        interval: Duration,
        cancel: &CancellationToken,
        stats: &mut CollectionStats,
    ) {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 첫 tick은 즉시 반환되므로 소비
        ticker.tick().await;

        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            sinks = ?self.sinks.enabled_names(),
            "Periodic aggregation started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.record_cycle(cancel, stats).await;
        }
        stats.elapsed = started.elapsed();
        tracing::info!(cycles = stats.cycles, "Periodic aggregation stopped");
    }

    /// 한 주기를 실행하고 결과를 통계에 반영합니다.
    pub async fn record_cycle(&mut self, cancel: &CancellationToken, stats: &mut CollectionStats) {
        match self.collect_once(cancel).await {
            Ok(Some(outcome)) => stats.record_dispatch(outcome.rows, &outcome.report),
            Ok(None) => {
                stats.cycles += 1;
                stats.skipped += 1;
            }
            Err(CollectorError::Exchange(ExchangeError::Cancelled)) => {}
            Err(e) => {
                stats.cycles += 1;
                stats.errors += 1;
                tracing::error!(error = %e, "Aggregation cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use depth_core::{DepthKind, DepthUpdate, Exchange, LevelUpdate, ManualClock};
    use depth_exchange::{ChannelSink, ExchangeResult, Sink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 호출 횟수를 세고 설정된 횟수만큼 실패하는 싱크
    struct FlakySink {
        calls: AtomicUsize,
        failures: usize,
    }

    impl FlakySink {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _batch: Arc<SinkBatch>, _cancel: &CancellationToken) -> ExchangeResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ExchangeError::NetworkError("sink offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn seeded_store() -> Arc<OrderBookStore> {
        let store = Arc::new(OrderBookStore::new());
        for (symbol, base) in [("BTCUSDT", 100.0), ("ETHUSDT", 10.0)] {
            let mut update = DepthUpdate::new(Exchange::Binance, symbol, DepthKind::Snapshot);
            for i in 0..5 {
                update.bids.push(LevelUpdate::new(base - i as f64, 1.0 + i as f64));
                update.asks.push(LevelUpdate::new(base + 1.0 + i as f64, 2.0));
            }
            store.apply(&update);
        }
        store
    }

    fn aggregator_config(max_retries: u32) -> AggregatorConfig {
        AggregatorConfig {
            size: 4,
            interval_ms: 60_000,
            seed: Some(7),
            max_retries,
        }
    }

    #[test]
    fn test_aggregate_builds_fixed_size_rows() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let mut collector =
            OrderbookCollector::new(seeded_store(), SinkRegistry::new(), &aggregator_config(0))
                .with_clock(clock.clone());

        let batch = collector.aggregate();
        assert_eq!(batch.timestamp, clock.now());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows[0].symbol, "BTCUSDT");
        assert_eq!(batch.rows[1].symbol, "ETHUSDT");
        for row in &batch.rows {
            assert_eq!(row.bids.len(), 4);
            assert_eq!(row.asks.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_empty_store_skips_dispatch() {
        let sink = FlakySink::new(0);
        let mut sinks = SinkRegistry::new();
        sinks.register(sink.clone());
        let mut collector = OrderbookCollector::new(
            Arc::new(OrderBookStore::new()),
            sinks,
            &aggregator_config(3),
        );

        let mut stats = CollectionStats::new();
        collector.record_cycle(&CancellationToken::new(), &mut stats).await;
        assert_eq!(sink.calls(), 0);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_retried_when_every_sink_fails() {
        let sink = FlakySink::new(2);
        let mut sinks = SinkRegistry::new();
        sinks.register(sink.clone());
        let mut collector = OrderbookCollector::new(seeded_store(), sinks, &aggregator_config(3));

        let outcome = collector
            .collect_once(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.calls(), 3);
        assert_eq!(outcome.rows, 2);
        assert_eq!(outcome.report.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_is_not_retried() {
        let flaky = FlakySink::new(usize::MAX);
        let (channel, mut rx) = ChannelSink::channel("channel", 4);
        let mut sinks = SinkRegistry::new();
        sinks.register(flaky.clone()).register(Arc::new(channel));
        let mut collector = OrderbookCollector::new(seeded_store(), sinks, &aggregator_config(3));

        let mut stats = CollectionStats::new();
        collector.record_cycle(&CancellationToken::new(), &mut stats).await;

        assert_eq!(flaky.calls(), 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.sink_failures, 1);
        assert_eq!(stats.books, 2);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        // 두 번째 배치는 없어야 함
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_as_error() {
        let sink = FlakySink::new(usize::MAX);
        let mut sinks = SinkRegistry::new();
        sinks.register(sink.clone());
        let mut collector = OrderbookCollector::new(seeded_store(), sinks, &aggregator_config(2));

        let mut stats = CollectionStats::new();
        collector.record_cycle(&CancellationToken::new(), &mut stats).await;
        assert_eq!(sink.calls(), 3);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_periodic_stops_on_cancel() {
        let (channel, mut rx) = ChannelSink::channel("channel", 8);
        let mut sinks = SinkRegistry::new();
        sinks.register(Arc::new(channel));
        let mut collector = OrderbookCollector::new(seeded_store(), sinks, &aggregator_config(0));

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            stopper.cancel();
        });

        let mut stats = CollectionStats::new();
        collector
            .run_periodic(Duration::from_secs(1), &cancel, &mut stats)
            .await;

        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.errors, 0);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }
}
