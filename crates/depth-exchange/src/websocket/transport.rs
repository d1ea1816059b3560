//! 프레임 단위 WebSocket 전송 계층.
//!
//! `FramedTransport` 하나는 논리적 WebSocket 연결 하나를 소유합니다.
//! 수신 루프는 연결 확인, 조각 수신과 재조립, 라우팅 키 사전 파싱, 핸들러
//! 디스패치를 반복하며, 연결 장애는 닫고 다시 연결하는 것으로 처리합니다.
//!
//! # 실패 처리
//!
//! - 수신 타임아웃: 다시 대기
//! - 잘못된 메시지, 크기 초과, 소켓 에러: 연결을 닫고 재연결
//! - 종료 토큰이 취소된 상태에서의 해제: `Ok(())`
//! - 종료 토큰 없이 해제되거나 핸들러가 치명적 에러를 반환: 에러 전파

use async_trait::async_trait;
use depth_core::TransportConfig;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::ReceiveBuffer;
use super::socket::{WsConnector, WsSink, WsSource};
use crate::preparse::RoutingKey;
use crate::traits::{ExchangeResult, FilterDecision};
use crate::ExchangeError;

/// 전송 계층이 메시지를 넘기는 대상.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 다음 연결에 사용할 URL.
    fn connect_url(&self) -> String;

    /// 지금까지 받은 바이트로 메시지 처리 방향을 결정합니다.
    fn classify(&self, bytes: &[u8], complete: bool) -> FilterDecision;

    /// 유휴 시 보낼 ping 프레임.
    fn ping_frame(&self) -> Option<String> {
        None
    }

    /// 새 연결이 열린 직후 호출됩니다 (구독 프레임 전송 등).
    async fn on_connected(&self, _transport: &FramedTransport) -> ExchangeResult<()> {
        Ok(())
    }

    /// 완성된 메시지를 처리합니다.
    ///
    /// 치명적이지 않은 에러는 연결을 닫게 하고, 치명적 에러는 수신 루프를 끝냅니다.
    async fn dispatch(
        &self,
        transport: &FramedTransport,
        key: RoutingKey,
        payload: &[u8],
    ) -> ExchangeResult<()>;
}

/// 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Faulted,
}

/// 열린 연결 하나. 재연결 시 새 인스턴스로 교체됩니다.
struct Connection {
    id: u64,
    sink: tokio::sync::Mutex<Box<dyn WsSink>>,
    source: tokio::sync::Mutex<Box<dyn WsSource>>,
    closed: AtomicBool,
    close_signal: CancellationToken,
}

impl Connection {
    fn new(id: u64, sink: Box<dyn WsSink>, source: Box<dyn WsSource>) -> Self {
        Self {
            id,
            sink: tokio::sync::Mutex::new(sink),
            source: tokio::sync::Mutex::new(source),
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 닫힘으로 표시합니다. 처음 표시한 호출만 `true`.
    fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.close_signal.cancel();
        first
    }
}

enum Received {
    Message(RoutingKey),
    Ignored,
    TimedOut { ping_unanswered: bool },
    Closed,
    Interrupted,
}

/// 프레임 단위 WebSocket 전송 계층.
pub struct FramedTransport {
    name: String,
    config: TransportConfig,
    connector: Arc<dyn WsConnector>,
    handler: Arc<dyn MessageHandler>,
    connect_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<Connection>>>,
    state: Mutex<ConnectionState>,
    connection_counter: AtomicU64,
    messages_dispatched: AtomicU64,
    running: AtomicBool,
    disposed: CancellationToken,
}

impl FramedTransport {
    /// 새 전송 계층. 연결은 `run` 또는 `connect_if_needed`에서 맺습니다.
    pub fn new(
        name: impl Into<String>,
        config: TransportConfig,
        connector: Arc<dyn WsConnector>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            connector,
            handler,
            connect_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            connection_counter: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            running: AtomicBool::new(false),
            disposed: CancellationToken::new(),
        }
    }

    /// 로그용 이름.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 설정.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// 현재 연결 상태.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// 성공한 연결 수.
    pub fn connection_counter(&self) -> u64 {
        self.connection_counter.load(Ordering::Relaxed)
    }

    /// 핸들러에 넘긴 메시지 수.
    pub fn messages_dispatched(&self) -> u64 {
        self.messages_dispatched.load(Ordering::Relaxed)
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_current(&self) -> Option<Arc<Connection>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// 열린 연결이 없으면 `true`.
    pub fn is_closed(&self) -> bool {
        self.current().map_or(true, |c| c.is_closed())
    }

    /// 연결이 없을 때만 연결합니다. 새로 연결했으면 `Ok(true)`.
    ///
    /// 동시에 호출돼도 연결은 한 번만 맺어집니다.
    pub async fn connect_if_needed(&self) -> ExchangeResult<bool> {
        if self.disposed.is_cancelled() {
            return Err(ExchangeError::Disposed(self.name.clone()));
        }
        if !self.is_closed() {
            return Ok(false);
        }

        let guard = self.connect_lock.lock().await;
        if !self.is_closed() {
            return Ok(false);
        }
        if let Some(stale) = self.take_current() {
            self.close_connection(&stale).await;
        }

        self.set_state(ConnectionState::Connecting);
        let url = self.handler.connect_url();
        info!(transport = %self.name, url = %url, "Connecting");

        let attempt = tokio::select! {
            _ = self.disposed.cancelled() => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ExchangeError::Disposed(self.name.clone()));
            }
            attempt = timeout(self.config.connect_timeout(), self.connector.connect(&url)) => attempt,
        };
        let (sink, source) = match attempt {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Faulted);
                return Err(e);
            }
            Err(_) => {
                self.set_state(ConnectionState::Faulted);
                return Err(ExchangeError::Timeout(format!(
                    "connect to {} after {:?}",
                    url,
                    self.config.connect_timeout()
                )));
            }
        };

        let id = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(Connection::new(id, sink, source)));
        self.set_state(ConnectionState::Open);
        info!(transport = %self.name, connection = id, "Connected");
        drop(guard);

        if let Err(e) = self.handler.on_connected(self).await {
            warn!(transport = %self.name, connection = id, error = %e, "Connection setup failed");
            self.force_close().await;
            return Err(e);
        }
        Ok(true)
    }

    /// 텍스트 프레임을 보냅니다. 실패하면 연결을 닫습니다.
    pub async fn send_text(&self, text: &str) -> ExchangeResult<()> {
        let connection = match self.current() {
            Some(connection) if !connection.is_closed() => connection,
            _ => {
                return Err(ExchangeError::Disconnected(format!(
                    "{} has no open connection",
                    self.name
                )))
            }
        };

        let result = connection.sink.lock().await.send_text(text).await;
        if let Err(e) = &result {
            warn!(transport = %self.name, connection = connection.id, error = %e, "Send failed");
            self.retire(&connection).await;
        }
        result
    }

    /// 현재 연결을 닫습니다. 수신 루프는 다음 반복에서 재연결합니다.
    pub async fn force_close(&self) {
        if let Some(connection) = self.take_current() {
            self.close_connection(&connection).await;
        }
    }

    /// 전송 계층을 해제합니다. 이후 연결 시도는 `Disposed` 에러가 됩니다.
    pub async fn dispose(&self) {
        self.disposed.cancel();
        self.force_close().await;
    }

    async fn retire(&self, connection: &Arc<Connection>) {
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, connection))
            {
                *current = None;
            }
        }
        self.close_connection(connection).await;
    }

    /// 닫기를 시도합니다. 에러는 기록만 하고 전파하지 않습니다.
    async fn close_connection(&self, connection: &Connection) {
        if !connection.mark_closed() {
            return;
        }
        self.set_state(ConnectionState::Closing);

        let close = async { connection.sink.lock().await.close().await };
        match timeout(self.config.close_timeout(), close).await {
            Ok(Ok(())) => debug!(transport = %self.name, connection = connection.id, "Connection closed"),
            Ok(Err(e)) => {
                debug!(transport = %self.name, connection = connection.id, error = %e, "Close failed")
            }
            Err(_) => warn!(transport = %self.name, connection = connection.id, "Close timed out"),
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// 수신 루프. 종료 토큰이 취소될 때까지 실행됩니다.
    ///
    /// 동시에 두 번 실행할 수 없습니다.
    pub async fn run(&self, shutdown: CancellationToken) -> ExchangeResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ExchangeError::NotSupported(format!(
                "{} receive loop is already running",
                self.name
            )));
        }

        let result = self.receive_loop(&shutdown).await;
        self.running.store(false, Ordering::Release);
        self.force_close().await;
        result
    }

    fn disposed_exit(&self, shutdown: &CancellationToken) -> ExchangeResult<()> {
        if shutdown.is_cancelled() {
            debug!(transport = %self.name, "Transport disposed during shutdown");
            Ok(())
        } else {
            Err(ExchangeError::Disposed(self.name.clone()))
        }
    }

    async fn receive_loop(&self, shutdown: &CancellationToken) -> ExchangeResult<()> {
        let mut buffer = ReceiveBuffer::new(
            self.config.additional_receive_buffer_size,
            self.config.max_message_size,
        );

        loop {
            if shutdown.is_cancelled() {
                debug!(transport = %self.name, "Receive loop stopped");
                return Ok(());
            }
            if self.disposed.is_cancelled() {
                return self.disposed_exit(shutdown);
            }

            let connection = match self.connect_if_needed().await {
                Ok(_) => match self.current() {
                    Some(connection) if !connection.is_closed() => connection,
                    _ => continue,
                },
                Err(ExchangeError::Disposed(_)) => return self.disposed_exit(shutdown),
                Err(e) => {
                    warn!(transport = %self.name, error = %e, "Connect failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = self.disposed.cancelled() => {}
                        _ = sleep(with_jitter(self.config.reconnect_delay())) => {}
                    }
                    continue;
                }
            };

            let received = self.receive_message(&connection, &mut buffer, shutdown).await;
            match received {
                Ok(Received::Message(key)) => {
                    let result = self
                        .handler
                        .dispatch(self, key.clone(), buffer.as_slice())
                        .await;
                    buffer.clear();
                    self.messages_dispatched.fetch_add(1, Ordering::Relaxed);

                    if let Err(e) = result {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(
                            transport = %self.name,
                            connection = connection.id,
                            key = %key,
                            error = %e,
                            "Handler failed, closing connection"
                        );
                        self.retire(&connection).await;
                    }
                }
                Ok(Received::Ignored) | Ok(Received::Interrupted) => buffer.clear(),
                Ok(Received::TimedOut { ping_unanswered }) => {
                    buffer.clear();
                    if ping_unanswered {
                        warn!(transport = %self.name, connection = connection.id, "Ping unanswered, reconnecting");
                        self.retire(&connection).await;
                    } else {
                        debug!(transport = %self.name, connection = connection.id, "Receive timed out");
                    }
                }
                Ok(Received::Closed) => {
                    buffer.clear();
                    info!(transport = %self.name, connection = connection.id, "Connection closed by server");
                    self.retire(&connection).await;
                }
                Err(e) => {
                    buffer.clear();
                    warn!(transport = %self.name, connection = connection.id, error = %e, "Connection fault");
                    self.set_state(ConnectionState::Faulted);
                    self.retire(&connection).await;
                }
            }
        }
    }

    /// 메시지 하나를 받습니다. 완성된 메시지의 바이트는 `buffer`에 남습니다.
    async fn receive_message(
        &self,
        connection: &Connection,
        buffer: &mut ReceiveBuffer,
        shutdown: &CancellationToken,
    ) -> ExchangeResult<Received> {
        let mut source = connection.source.lock().await;
        let ping_frame = self.handler.ping_frame();
        let ping_interval = self.config.ping_interval();

        let mut routed: Option<RoutingKey> = None;
        let mut ignoring = false;
        let mut pinged = false;
        let mut next_ping = Instant::now() + ping_interval;
        let mut deadline = Instant::now() + self.config.receive_timeout();

        loop {
            let ping_due = ping_frame.is_some() && buffer.is_empty() && !ignoring;
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(Received::Interrupted),
                _ = self.disposed.cancelled() => return Ok(Received::Interrupted),
                _ = connection.close_signal.cancelled() => return Ok(Received::Interrupted),
                _ = sleep_until(next_ping), if ping_due => {
                    if let Some(frame) = &ping_frame {
                        connection.sink.lock().await.send_text(frame).await?;
                        debug!(transport = %self.name, connection = connection.id, "Ping sent");
                    }
                    pinged = true;
                    next_ping = Instant::now() + ping_interval;
                    continue;
                }
                received = timeout_at(deadline, source.receive()) => received,
            };

            let fragment = match received {
                Err(_) if buffer.is_empty() && !ignoring => {
                    return Ok(Received::TimedOut {
                        ping_unanswered: pinged,
                    })
                }
                Err(_) => {
                    return Err(ExchangeError::Protocol(format!(
                        "Timed out in the middle of a message after {} bytes",
                        buffer.len()
                    )))
                }
                Ok(None) => return Ok(Received::Closed),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(fragment))) => fragment,
            };
            deadline = Instant::now() + self.config.receive_timeout();

            if fragment.data.is_empty() && (!fragment.end_of_message || buffer.is_empty()) {
                if fragment.end_of_message && ignoring {
                    return Ok(Received::Ignored);
                }
                continue;
            }
            if ignoring {
                if fragment.end_of_message {
                    return Ok(Received::Ignored);
                }
                continue;
            }

            buffer.append(&fragment.data)?;
            let complete = fragment.end_of_message;

            if routed.is_none() {
                match self.handler.classify(buffer.as_slice(), complete) {
                    FilterDecision::Route(key) => routed = Some(key),
                    FilterDecision::NeedMore => {}
                    FilterDecision::Ignore => {
                        if complete {
                            return Ok(Received::Ignored);
                        }
                        ignoring = true;
                        buffer.clear();
                        continue;
                    }
                    FilterDecision::Invalid => {
                        return Err(ExchangeError::Protocol(format!(
                            "Malformed message ({} bytes)",
                            buffer.len()
                        )))
                    }
                }
            }

            if complete {
                return Ok(match routed {
                    Some(key) => Received::Message(key),
                    None => Received::Ignored,
                });
            }
        }
    }
}

/// 재연결이 한꺼번에 몰리지 않도록 최대 25%를 더합니다.
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 4) as u64;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

impl std::fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("connection_counter", &self.connection_counter())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preparse::{routing_key_from_raw, scan, RoutePath, ScanOutcome};
    use crate::websocket::{ScriptedConnector, ScriptedSession};
    use tokio::sync::mpsc;

    const FTX_PATHS: &[RoutePath] = &[RoutePath::Field("market"), RoutePath::Field("type")];

    struct RecordingHandler {
        tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
        fail_on: Option<&'static str>,
        ping: Option<&'static str>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        fn connect_url(&self) -> String {
            "ws://scripted".to_string()
        }

        fn classify(&self, bytes: &[u8], complete: bool) -> FilterDecision {
            match scan(bytes, FTX_PATHS) {
                ScanOutcome::Found(raw) => routing_key_from_raw(raw)
                    .map(FilterDecision::Route)
                    .unwrap_or(FilterDecision::Invalid),
                ScanOutcome::Absent => FilterDecision::Ignore,
                ScanOutcome::Incomplete if complete => FilterDecision::Invalid,
                ScanOutcome::Incomplete => FilterDecision::NeedMore,
                ScanOutcome::Invalid => FilterDecision::Invalid,
            }
        }

        fn ping_frame(&self) -> Option<String> {
            self.ping.map(str::to_string)
        }

        async fn dispatch(
            &self,
            _transport: &FramedTransport,
            key: RoutingKey,
            payload: &[u8],
        ) -> ExchangeResult<()> {
            if self.fail_on == Some(&*key) {
                return Err(ExchangeError::NotSupported(key.to_string()));
            }
            let _ = self.tx.send((key.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            reconnect_delay_ms: 10,
            receive_timeout_ms: 60_000,
            connect_timeout_ms: 1_000,
            close_timeout_ms: 100,
            ..Default::default()
        }
    }

    fn transport(
        sessions: Vec<ScriptedSession>,
        config: TransportConfig,
    ) -> (
        Arc<FramedTransport>,
        ScriptedConnector,
        mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new(sessions);
        let handler = Arc::new(RecordingHandler {
            tx,
            fail_on: None,
            ping: None,
        });
        let transport = Arc::new(FramedTransport::new(
            "test",
            config,
            Arc::new(connector.clone()),
            handler,
        ));
        (transport, connector, rx)
    }

    fn spawn_run(
        transport: &Arc<FramedTransport>,
        shutdown: &CancellationToken,
    ) -> tokio::task::JoinHandle<ExchangeResult<()>> {
        let transport = transport.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { transport.run(shutdown).await })
    }

    const SUBSCRIBE: &str = r#"{"op":"subscribe","channel":"orderbook","market":"BTC-PERP"}"#;

    #[tokio::test]
    async fn test_fragmented_message_dispatched_once() {
        let session = ScriptedSession::new().split_message(SUBSCRIBE, &[10, 25]);
        let (transport, _connector, mut rx) = transport(vec![session], test_config());
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);

        let (key, payload) = rx.recv().await.unwrap();
        assert_eq!(key, "BTC-PERP");
        assert_eq!(payload, SUBSCRIBE.as_bytes());

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(transport.connection_counter(), 1);
        assert_eq!(transport.messages_dispatched(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_message_reconnects() {
        let first = ScriptedSession::new().message(r#"{"x":tru,"market":"A"}"#);
        let second = ScriptedSession::new().message(r#"{"market":"B"}"#);
        let (transport, connector, mut rx) = transport(vec![first, second], test_config());
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);

        let (key, _) = rx.recv().await.unwrap();
        assert_eq!(key, "B");
        assert_eq!(transport.connection_counter(), 2);
        assert!(connector.close_count() >= 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unrouted_message_ignored() {
        let session = ScriptedSession::new()
            .split_message(r#"{"channel":"x","data":{"market":"NO"}}"#, &[5])
            .message(r#"{"type":"pong"}"#);
        let (transport, _connector, mut rx) = transport(vec![session], test_config());
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);

        let (key, _) = rx.recv().await.unwrap();
        assert_eq!(key, "pong");
        assert_eq!(transport.connection_counter(), 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_closes_connection() {
        let big = format!(r#"{{"market":"A","pad":"{}"}}"#, "x".repeat(200));
        let first = ScriptedSession::new().split_message(&big, &[50, 100, 150]);
        let second = ScriptedSession::new().message(r#"{"market":"SMALL"}"#);
        let config = TransportConfig {
            max_message_size: 128,
            additional_receive_buffer_size: 16,
            ..test_config()
        };
        let (transport, _connector, mut rx) = transport(vec![first, second], config);
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);

        let (key, _) = rx.recv().await.unwrap();
        assert_eq!(key, "SMALL");
        assert_eq!(transport.connection_counter(), 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_close_reconnects() {
        let first = ScriptedSession::new().close();
        let second = ScriptedSession::new().message(r#"{"market":"B"}"#);
        let (transport, _connector, mut rx) = transport(vec![first, second], test_config());
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);

        assert_eq!(rx.recv().await.unwrap().0, "B");
        assert_eq!(transport.connection_counter(), 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dispose_without_shutdown_is_error() {
        let (transport, _connector, mut rx) = transport(
            vec![ScriptedSession::new().message(r#"{"market":"A"}"#)],
            test_config(),
        );
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);
        rx.recv().await.unwrap();

        transport.dispose().await;
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ExchangeError::Disposed(_))));
        assert!(transport.connect_if_needed().await.is_err());
    }

    #[tokio::test]
    async fn test_dispose_during_shutdown_is_ok() {
        let (transport, _connector, mut rx) = transport(
            vec![ScriptedSession::new().message(r#"{"market":"A"}"#)],
            test_config(),
        );
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);
        rx.recv().await.unwrap();

        shutdown.cancel();
        transport.dispose().await;
        assert!(task.await.unwrap().is_ok());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_fatal_handler_error_propagates() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new([ScriptedSession::new().message(r#"{"market":"BAD"}"#)]);
        let handler = Arc::new(RecordingHandler {
            tx,
            fail_on: Some("BAD"),
            ping: None,
        });
        let transport = FramedTransport::new("fatal", test_config(), Arc::new(connector), handler);

        let result = transport.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ExchangeError::NotSupported(_))));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_run_is_not_reentrant() {
        let (transport, _connector, _rx) =
            transport(vec![ScriptedSession::new()], test_config());
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);

        // 첫 루프가 연결할 때까지 대기
        while transport.connection_counter() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(transport.run(shutdown.clone()).await.is_err());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_if_needed_is_idempotent() {
        let (transport, connector, _rx) =
            transport(vec![ScriptedSession::new()], test_config());
        let (a, b) = tokio::join!(transport.connect_if_needed(), transport.connect_if_needed());
        assert!(a.unwrap() ^ b.unwrap());
        assert_eq!(connector.connect_count(), 1);
        assert!(!transport.connect_if_needed().await.unwrap());

        transport.send_text("hello").await.unwrap();
        assert_eq!(connector.sent_frames(), vec!["hello".to_string()]);

        transport.force_close().await;
        assert!(transport.is_closed());
        assert!(transport.send_text("again").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_pings() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::new([ScriptedSession::new()]);
        let handler = Arc::new(RecordingHandler {
            tx,
            fail_on: None,
            ping: Some(r#"{"op":"ping"}"#),
        });
        let config = TransportConfig {
            ping_interval_ms: 1_000,
            ..test_config()
        };
        let transport = Arc::new(FramedTransport::new(
            "ping",
            config,
            Arc::new(connector.clone()),
            handler,
        ));
        let shutdown = CancellationToken::new();
        let task = spawn_run(&transport, &shutdown);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(connector.sent_frames().len(), 3);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
