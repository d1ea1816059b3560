//! 연결 플릿 오케스트레이션.
//!
//! - `handler`: 디코딩된 메시지를 저장소와 구독 상태에 반영
//! - `pool`: 심볼을 전송 계층에 배분하고 수신 루프를 관리
//! - `resync`: REST 스냅샷 재동기화

mod handler;
mod pool;
mod resync;

pub use handler::BookEventHandler;
pub use pool::{ExchangeTransport, TransportFleet};
pub use resync::{ResyncQueue, ResyncRequest, ResyncWorker, DEFAULT_SNAPSHOT_LIMIT};
