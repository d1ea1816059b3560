//! Order book depth collector CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use depth_collector::modules::{
    binance_rest_client, build_sinks, discover_symbols, OrderbookCollector, Pipeline,
};
use depth_collector::{CollectionStats, CollectorConfig};
use depth_core::{init_logging, LogConfig};
use depth_exchange::{SinkRegistry, TungsteniteConnector, WeightedRateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "depth-collector")]
#[command(about = "Exchange order book depth collector", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 로그 레벨 (trace, debug, info, warn, error). 없으면 설정 파일 값
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// 설정 파일 경로
    #[arg(long, global = true, env = "DEPTH_CONFIG")]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 수집과 주기 집계 실행 (Ctrl-C까지)
    Run,

    /// 수집 대상 심볼 조회
    Symbols,

    /// 정해진 시간 동안 수집 후 한 번 집계해 출력
    Once {
        /// 수집 시간 (초). 없으면 ONCE_DURATION_SECS
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CollectorConfig::from_env(cli.config.as_deref()).context("설정 로드 실패")?;

    let mut log_config = LogConfig::from_section(&config.app.logging);
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    init_logging(log_config).map_err(|e| anyhow::anyhow!("로깅 초기화 실패: {}", e))?;

    tracing::info!(
        exchanges = ?config.app.exchanges.enabled().iter().map(|(e, _)| e.to_string()).collect::<Vec<_>>(),
        "Depth collector starting"
    );

    match cli.command {
        Commands::Run => run(&config).await?,
        Commands::Symbols => list_symbols(&config).await?,
        Commands::Once { seconds } => {
            let duration = seconds.map(Duration::from_secs).unwrap_or_else(|| config.once_duration());
            once(&config, duration).await?;
        }
    }

    tracing::info!("Depth collector finished");
    Ok(())
}

/// Ctrl-C를 받으면 토큰을 취소합니다.
fn cancel_on_ctrl_c(shutdown: &CancellationToken) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        }
    });
}

async fn run(config: &CollectorConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(&shutdown);

    let mut pipeline = Pipeline::build(config, Arc::new(TungsteniteConnector), &shutdown).await?;
    pipeline.start(shutdown.clone()).await;

    let (sinks, mut monitor) = build_sinks(&config.app.sinks);
    let monitor_task = tokio::spawn(async move {
        while let Some(batch) = monitor.recv().await {
            tracing::info!(
                timestamp = %batch.timestamp,
                rows = batch.len(),
                "Batch aggregated"
            );
        }
    });

    let mut collector = OrderbookCollector::new(pipeline.store().clone(), sinks, &config.app.aggregator);
    let mut stats = CollectionStats::new();
    collector
        .run_periodic(
            Duration::from_millis(config.app.aggregator.interval_ms),
            &shutdown,
            &mut stats,
        )
        .await;
    stats.log_summary("orderbook_collect");

    drop(collector);
    if let Err(e) = monitor_task.await {
        tracing::warn!(error = %e, "Monitor task ended abnormally");
    }
    pipeline.stop().await?;
    Ok(())
}

async fn list_symbols(config: &CollectorConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let limiter = Arc::new(WeightedRateLimiter::new(config.app.rate_limiter.clone()));
    let rest = binance_rest_client(config, &limiter)?;

    for (exchange, endpoints) in config.app.exchanges.enabled() {
        let symbols =
            discover_symbols(exchange, endpoints, &config.discovery, rest.as_deref(), &cancel)
                .await
                .with_context(|| format!("{} 심볼 조회 실패", exchange))?;
        for symbol in symbols {
            println!("{}\t{}", exchange, symbol);
        }
    }
    tracing::info!(used_weight = limiter.computed_used_weight(), "Symbol listing finished");
    Ok(())
}

async fn once(config: &CollectorConfig, duration: Duration) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(&shutdown);

    let mut pipeline = Pipeline::build(config, Arc::new(TungsteniteConnector), &shutdown).await?;
    pipeline.start(shutdown.clone()).await;

    tracing::info!(seconds = duration.as_secs(), "Collecting");
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }

    let mut collector =
        OrderbookCollector::new(pipeline.store().clone(), SinkRegistry::new(), &config.app.aggregator);
    let batch = collector.aggregate();
    println!("{}", serde_json::to_string_pretty(&batch)?);

    shutdown.cancel();
    pipeline.stop().await?;
    Ok(())
}
