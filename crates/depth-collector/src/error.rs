//! 에러 타입 정의.

use depth_core::CoreError;
use depth_exchange::ExchangeError;
use thiserror::Error;

/// Collector 에러 타입
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 거래소 연동 에러 (WebSocket, REST, rate limit)
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// 핵심 도메인 에러
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// 입출력 에러
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::env::VarError> for CollectorError {
    fn from(err: std::env::VarError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;
