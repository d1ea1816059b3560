//! 거래소 연결 및 호가 데이터 수집.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 프레임 단위 WebSocket 전송 계층 (재연결, 재조립, 디스패치)
//! - 라우팅 키 사전 파서와 intern 캐시
//! - 거래소 프로토콜: Binance, OKX, FTX
//! - 가중치 기반 REST rate limiter와 Binance REST 클라이언트
//! - 연결 플릿, 재동기화, 싱크
//! - 주기 작업 재시도 정책

pub mod connector;
pub mod error;
pub mod fleet;
pub mod preparse;
pub mod rate_limiter;
pub mod rest;
pub mod retry;
pub mod sink;
pub mod subscription;
pub mod traits;
pub mod websocket;

pub use connector::{BinanceProtocol, FtxProtocol, OkxProtocol};
pub use error::*;
pub use fleet::{
    BookEventHandler, ExchangeTransport, ResyncQueue, ResyncRequest, ResyncWorker,
    TransportFleet,
};
pub use preparse::{try_extract_routing_key, InternCache, RoutePath, RoutingKey, ScanOutcome};
pub use rate_limiter::{ApiCallRegistration, WeightedRateLimiter};
pub use rest::{BinanceRestClient, ResponseMeta, SymbolInfo};
pub use retry::{with_retry, RetryConfig};
pub use sink::{ChannelSink, DispatchReport, JsonLinesSink, Sink, SinkBatch, SinkRegistry};
pub use subscription::{Subscription, SubscriptionReset, SubscriptionSet, SubscriptionState};
pub use traits::*;
pub use websocket::{
    ConnectionState, FramedTransport, MessageHandler, TungsteniteConnector, WsConnector,
};
