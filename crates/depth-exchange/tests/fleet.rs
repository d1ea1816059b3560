//! 전송 계층 플릿 시나리오 테스트 (스크립트 연결).

use depth_core::{
    DepthKind, DepthUpdate, Exchange, LevelUpdate, ManualClock, OrderBookStore, TransportConfig,
};
use depth_exchange::websocket::{ScriptedConnector, ScriptedSession};
use depth_exchange::{BinanceProtocol, OkxProtocol, TransportFleet};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BINANCE_WS: &str = "wss://stream.binance.test:9443";
const OKX_WS: &str = "wss://ws.okx.test:8443/ws/v5/public";

fn config(base_url: &str, soft_limit: usize) -> TransportConfig {
    TransportConfig {
        base_url: base_url.to_string(),
        reconnect_delay_ms: 10,
        close_timeout_ms: 100,
        max_stream_count_soft_limit: soft_limit,
        ..Default::default()
    }
}

fn binance_depth(symbol: &str, first: u64, last: u64) -> String {
    json!({
        "stream": format!("{}@depth@100ms", symbol.to_lowercase()),
        "data": {
            "e": "depthUpdate",
            "E": 1_700_000_000_123i64,
            "s": symbol,
            "U": first,
            "u": last,
            "b": [["100.10", "2.5"]],
            "a": [["100.20", "1.0"]]
        }
    })
    .to_string()
}

fn okx_ack(inst_id: &str) -> String {
    json!({"event": "subscribe", "arg": {"channel": "books", "instId": inst_id}}).to_string()
}

fn okx_snapshot(inst_id: &str) -> String {
    json!({
        "arg": {"channel": "books", "instId": inst_id},
        "action": "snapshot",
        "data": [{
            "asks": [["41006.8", "0.60038921", "0", "1"]],
            "bids": [["41006.3", "0.30178218", "0", "2"]],
            "ts": "1629966436396",
            "checksum": -855196043
        }]
    })
    .to_string()
}

fn frames(connector: &ScriptedConnector) -> Vec<Value> {
    connector
        .sent_frames()
        .iter()
        .map(|frame| serde_json::from_str(frame).unwrap())
        .collect()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_binance_fleet_splits_streams_by_soft_limit() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        ScriptedSession::new().message(&binance_depth("BTCUSDT", 10, 12)),
        ScriptedSession::new().message(&binance_depth("SOLUSDT", 3, 4)),
    ]));
    let store = Arc::new(OrderBookStore::new());
    let fleet = TransportFleet::new(
        BinanceProtocol,
        config(BINANCE_WS, 2),
        connector.clone(),
        store.clone(),
    )
    .with_clock(Arc::new(ManualClock::at_unix(1_700_000_000)));

    let added = fleet
        .add_symbols(["BTCUSDT", "ETHUSDT", "SOLUSDT"])
        .await
        .unwrap();
    assert_eq!(added, 3);
    assert_eq!(fleet.transport_count().await, 2);
    assert_eq!(fleet.symbol_count().await, 3);

    let shutdown = CancellationToken::new();
    fleet.start(shutdown.clone()).await;
    eventually("both books", || store.len() == 2).await;

    let mut urls = connector.urls();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            format!("{}/stream?streams=btcusdt@depth@100ms/ethusdt@depth@100ms", BINANCE_WS),
            format!("{}/stream?streams=solusdt@depth@100ms", BINANCE_WS),
        ]
    );
    // 결합 스트림은 구독 프레임을 보내지 않음
    assert!(connector.sent_frames().is_empty());
    assert_eq!(store.is_synced(Exchange::Binance, "BTCUSDT"), Some(false));
    assert_eq!(fleet.connection_count().await, 2);

    fleet.shutdown().await;
    fleet.join().await.unwrap();
}

#[tokio::test]
async fn test_binance_add_symbol_rebuilds_url() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        ScriptedSession::new(),
        ScriptedSession::new().message(&binance_depth("ETHUSDT", 1, 2)),
    ]));
    let store = Arc::new(OrderBookStore::new());
    let fleet = TransportFleet::new(
        BinanceProtocol,
        config(BINANCE_WS, 100),
        connector.clone(),
        store.clone(),
    );

    assert!(fleet.add_symbol("btcusdt").await.unwrap());
    let shutdown = CancellationToken::new();
    fleet.start(shutdown.clone()).await;
    eventually("first connection", || connector.connect_count() == 1).await;

    assert!(fleet.add_symbol("ETHUSDT").await.unwrap());
    eventually("reconnect", || connector.connect_count() == 2).await;
    eventually("eth book", || store.len() == 1).await;

    let urls = connector.urls();
    assert_eq!(urls[0], format!("{}/stream?streams=btcusdt@depth@100ms", BINANCE_WS));
    assert_eq!(
        urls[1],
        format!("{}/stream?streams=btcusdt@depth@100ms/ethusdt@depth@100ms", BINANCE_WS)
    );
    assert_eq!(fleet.transport_count().await, 1);
    assert_eq!(fleet.symbols().await, vec!["BTCUSDT", "ETHUSDT"]);

    shutdown.cancel();
    fleet.join().await.unwrap();
}

#[tokio::test]
async fn test_blacklist_and_duplicates_are_skipped() {
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));
    let fleet = TransportFleet::new(
        BinanceProtocol,
        config(BINANCE_WS, 10),
        connector.clone(),
        Arc::new(OrderBookStore::new()),
    )
    .with_blacklist(["btcusdt"]);

    assert!(fleet.is_blacklisted("BTCUSDT"));
    assert!(!fleet.add_symbol("BTCUSDT").await.unwrap());
    assert!(fleet.add_symbol("ETHUSDT").await.unwrap());
    assert!(!fleet.add_symbol("ethusdt").await.unwrap());
    assert_eq!(fleet.symbols().await, vec!["ETHUSDT"]);

    assert!(fleet.remove_symbol("ETHUSDT").await);
    assert!(!fleet.remove_symbol("ETHUSDT").await);
    assert_eq!(fleet.symbol_count().await, 0);
    // 시작 전에는 연결하지 않음
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn test_okx_subscribes_incrementally() {
    let connector = Arc::new(ScriptedConnector::new(vec![ScriptedSession::new()
        .message(&okx_ack("BTC-USDT"))
        .message(&okx_snapshot("BTC-USDT"))]));
    let store = Arc::new(OrderBookStore::new());
    let fleet = TransportFleet::new(OkxProtocol, config(OKX_WS, 50), connector.clone(), store.clone());

    assert!(fleet.add_symbol("btc-usdt").await.unwrap());
    let shutdown = CancellationToken::new();
    fleet.start(shutdown.clone()).await;
    eventually("snapshot applied", || {
        store.is_synced(Exchange::Okx, "BTC-USDT") == Some(true)
    })
    .await;

    assert_eq!(connector.urls(), vec![OKX_WS.to_string()]);
    assert_eq!(
        frames(&connector),
        vec![json!({"op": "subscribe", "args": [{"channel": "books", "instId": "BTC-USDT"}]})]
    );
    let best_bid = store
        .with_book(Exchange::Okx, "BTC-USDT", |book| book.best_bid())
        .flatten()
        .unwrap();
    assert!((best_bid.price - 41006.3).abs() < 1e-9);

    // 연결을 유지한 채 구독 추가/해제
    assert!(fleet.add_symbol("ETH-USDT").await.unwrap());
    assert!(fleet.remove_symbol("BTC-USDT").await);
    eventually("frames sent", || connector.sent_frames().len() == 3).await;
    let sent = frames(&connector);
    assert_eq!(sent[1]["op"], "subscribe");
    assert_eq!(sent[1]["args"][0]["instId"], "ETH-USDT");
    assert_eq!(sent[2]["op"], "unsubscribe");
    assert_eq!(sent[2]["args"][0]["instId"], "BTC-USDT");
    assert_eq!(connector.connect_count(), 1);

    fleet.shutdown().await;
    fleet.join().await.unwrap();
}

#[tokio::test]
async fn test_okx_remove_while_disconnected_drops_book() {
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));
    let store = Arc::new(OrderBookStore::new());
    let fleet = TransportFleet::new(OkxProtocol, config(OKX_WS, 50), connector.clone(), store.clone());

    assert!(fleet.add_symbol("BTC-USDT").await.unwrap());
    let mut snapshot = DepthUpdate::new(Exchange::Okx, "BTC-USDT", DepthKind::Snapshot);
    snapshot.bids = vec![LevelUpdate::new(100.0, 1.0)];
    snapshot.asks = vec![LevelUpdate::new(101.0, 1.0)];
    store.apply(&snapshot);
    assert_eq!(store.drain_snapshots().len(), 1);

    // 연결이 없으므로 해제 확인 없이 바로 정리
    assert!(fleet.remove_symbol("BTC-USDT").await);
    assert!(store.is_empty());
    assert!(store.drain_snapshots().is_empty());
    assert_eq!(fleet.symbol_count().await, 0);
    assert!(connector.sent_frames().is_empty());
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn test_okx_resubscribes_after_reconnect() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        ScriptedSession::new().message(&okx_ack("BTC-USDT")).close(),
        ScriptedSession::new()
            .message(&okx_ack("BTC-USDT"))
            .message(&okx_snapshot("BTC-USDT")),
    ]));
    let store = Arc::new(OrderBookStore::new());
    let fleet = TransportFleet::new(OkxProtocol, config(OKX_WS, 50), connector.clone(), store.clone());

    fleet.add_symbol("BTC-USDT").await.unwrap();
    let shutdown = CancellationToken::new();
    fleet.start(shutdown.clone()).await;
    eventually("second session snapshot", || store.len() == 1).await;

    assert_eq!(connector.connect_count(), 2);
    let sent = frames(&connector);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(sent[1]["args"][0]["instId"], "BTC-USDT");

    shutdown.cancel();
    fleet.join().await.unwrap();
}

#[tokio::test]
async fn test_okx_error_event_reconnects() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        ScriptedSession::new()
            .message(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#),
        ScriptedSession::new().message(&okx_snapshot("BTC-USDT")),
    ]));
    let store = Arc::new(OrderBookStore::new());
    let fleet = TransportFleet::new(OkxProtocol, config(OKX_WS, 50), connector.clone(), store.clone());

    fleet.add_symbol("BTC-USDT").await.unwrap();
    let shutdown = CancellationToken::new();
    fleet.start(shutdown.clone()).await;
    eventually("recovered snapshot", || store.len() == 1).await;

    assert_eq!(connector.connect_count(), 2);
    assert!(connector.close_count() >= 1);
    assert_eq!(fleet.symbols().await, vec!["BTC-USDT"]);

    shutdown.cancel();
    fleet.join().await.unwrap();
}
