//! 파이프라인 구성 테스트 (스크립트 연결 + mockito REST).

use depth_collector::modules::{build_sinks, OrderbookCollector, Pipeline};
use depth_collector::{CollectorConfig, CollectorError};
use depth_core::{Exchange, ExchangeEndpoints, SinkConfig};
use depth_exchange::websocket::{ScriptedConnector, ScriptedSession};
use depth_exchange::SinkRegistry;
use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BINANCE_WS: &str = "wss://stream.binance.test:9443";

const EXCHANGE_INFO: &str = r#"{"timezone":"UTC","symbols":[
    {"symbol":"SOLUSDT","status":"TRADING","baseAsset":"SOL","quoteAsset":"USDT"},
    {"symbol":"BTCUSDT","status":"TRADING","baseAsset":"BTC","quoteAsset":"USDT"},
    {"symbol":"ETHUSDT","status":"TRADING","baseAsset":"ETH","quoteAsset":"USDT"},
    {"symbol":"ETHBTC","status":"TRADING","baseAsset":"ETH","quoteAsset":"BTC"}
]}"#;

const DEPTH_BODY: &str = r#"{
    "lastUpdateId": 1027024,
    "bids": [["4.00000000", "431.00000000"], ["3.99000000", "12.50000000"]],
    "asks": [["4.00000200", "12.00000000"]]
}"#;

fn binance_depth(symbol: &str, first: u64, last: u64) -> String {
    json!({
        "stream": format!("{}@depth@100ms", symbol.to_lowercase()),
        "data": {
            "e": "depthUpdate",
            "E": 1_700_000_000_123i64,
            "s": symbol,
            "U": first,
            "u": last,
            "b": [["4.00000000", "430.0"]],
            "a": []
        }
    })
    .to_string()
}

fn binance_only(rest_url: &str) -> CollectorConfig {
    let mut config = CollectorConfig::default();
    for endpoints in config.app.exchanges.0.values_mut() {
        endpoints.enabled = false;
    }
    config.app.exchanges.0.insert(
        Exchange::Binance.to_string(),
        ExchangeEndpoints {
            enabled: true,
            ws_base_url: BINANCE_WS.to_string(),
            rest_base_url: rest_url.to_string(),
            symbols: Vec::new(),
            blacklist: vec!["SOLUSDT".to_string()],
        },
    );
    config.app.transport.reconnect_delay_ms = 10;
    config.app.transport.close_timeout_ms = 100;
    config.app.aggregator.size = 3;
    config.app.aggregator.seed = Some(1);
    config.discovery.quote_asset = Some("USDT".to_string());
    config.discovery.max_symbols = 2;
    config
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_pipeline_discovers_streams_and_resyncs() {
    let mut server = mockito::Server::new_async().await;
    let info = server
        .mock("GET", "/api/v3/exchangeInfo")
        .with_status(200)
        .with_header("X-MBX-USED-WEIGHT-1M", "10")
        .with_body(EXCHANGE_INFO)
        .create_async()
        .await;
    let depth = server
        .mock("GET", "/api/v3/depth")
        .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
        .with_status(200)
        .with_body(DEPTH_BODY)
        .create_async()
        .await;

    let config = binance_only(&server.url());
    let connector = Arc::new(ScriptedConnector::new(vec![
        ScriptedSession::new().message(&binance_depth("BTCUSDT", 10, 12)),
    ]));
    let shutdown = CancellationToken::new();

    let mut pipeline = Pipeline::build(&config, connector.clone(), &shutdown)
        .await
        .unwrap();
    assert_eq!(pipeline.fleets().len(), 1);
    assert_eq!(pipeline.symbol_count().await, 2);
    assert!(pipeline.rest().is_some());
    info.assert_async().await;

    pipeline.start(shutdown.clone()).await;
    let store = pipeline.store().clone();
    eventually("resynced book", || {
        store.is_synced(Exchange::Binance, "BTCUSDT") == Some(true)
    })
    .await;
    depth.assert_async().await;

    // 블랙리스트(SOLUSDT)는 최대 개수 제한 전에 제외됨
    assert_eq!(
        connector.urls()[0],
        format!("{}/stream?streams=btcusdt@depth@100ms/ethusdt@depth@100ms", BINANCE_WS)
    );
    assert!(pipeline.limiter().computed_used_weight() >= 10);

    let mut collector =
        OrderbookCollector::new(store.clone(), SinkRegistry::new(), &config.app.aggregator);
    let batch = collector.aggregate();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.rows[0].symbol, "BTCUSDT");
    assert_eq!(batch.rows[0].bids.len(), 3);
    assert_eq!(batch.rows[0].asks.len(), 3);

    shutdown.cancel();
    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_requires_symbols_without_rest() {
    let mut config = CollectorConfig::default();
    for endpoints in config.app.exchanges.0.values_mut() {
        endpoints.enabled = false;
    }
    if let Some(okx) = config.app.exchanges.0.get_mut(&Exchange::Okx.to_string()) {
        okx.enabled = true;
    }

    let connector = Arc::new(ScriptedConnector::new(Vec::new()));
    let result = Pipeline::build(&config, connector.clone(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(CollectorError::Config(_))));
    assert_eq!(connector.connect_count(), 0);
}

#[test]
fn test_build_sinks_always_has_monitor() {
    let (sinks, _rx) = build_sinks(&SinkConfig::default());
    assert_eq!(sinks.enabled_names(), vec!["monitor".to_string()]);

    let path = std::env::temp_dir().join("depth-collector-sinks.jsonl");
    let config = SinkConfig {
        jsonl_path: Some(path.display().to_string()),
        channel_capacity: 8,
    };
    let (sinks, rx) = build_sinks(&config);
    assert_eq!(sinks.len(), 2);
    assert!(sinks.enabled_names()[0].starts_with("jsonl:"));

    // 수신 측이 사라지면 모니터는 비활성
    drop(rx);
    assert_eq!(sinks.enabled_names().len(), 1);
}
