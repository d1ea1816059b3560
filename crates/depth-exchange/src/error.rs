//! 거래소 에러 타입.

use thiserror::Error;

/// 거래소 관련 에러.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 거래소 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 요청 한도 초과 (HTTP 418/429)
    #[error("Rate limit exceeded: HTTP {status}")]
    RateLimited { status: u16 },

    /// API 에러 코드
    #[error("API error {code}: {message}")]
    ApiError { code: i32, message: String },

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 프로토콜 위반 (잘못된 프레임, 너무 큰 메시지 등)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WebSocket 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 취소됨 (종료 토큰 또는 호출자 취소)
    #[error("Operation cancelled")]
    Cancelled,

    /// rate limiter 슬롯 대기 시간 초과
    #[error("Timed out waiting for rate limit slot after {waited_ms}ms (weight {weight})")]
    SlotWaitTimeout { weight: i64, waited_ms: u64 },

    /// 허용 범위를 벗어난 가중치
    #[error("Invalid weight {weight} (max {max})")]
    InvalidWeight { weight: i64, max: i64 },

    /// 구독 상태 전이 위반
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// 트랜스포트가 이미 해제됨
    #[error("Transport disposed: {0}")]
    Disposed(String),

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// 지원되지 않는 작업
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::Disconnected(_)
                | ExchangeError::RateLimited { .. }
                | ExchangeError::Timeout(_)
                | ExchangeError::WebSocket(_)
                | ExchangeError::SlotWaitTimeout { .. }
        )
    }

    /// 권장 재시도 대기 시간(밀리초) 반환.
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimited { .. } => Some(60000), // 1분
            ExchangeError::NetworkError(_) => Some(1000),
            ExchangeError::Disconnected(_) => Some(5000),
            ExchangeError::Timeout(_) => Some(500),
            ExchangeError::WebSocket(_) => Some(2000),
            ExchangeError::SlotWaitTimeout { .. } => Some(1000),
            _ => None,
        }
    }

    /// 재시도하면 안 되는 치명적 에러인지 확인.
    ///
    /// 수신 루프는 핸들러가 돌려준 치명적 에러를 호출자에게 전파합니다.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::Disposed(_)
                | ExchangeError::InvalidWeight { .. }
                | ExchangeError::NotSupported(_)
        )
    }

    /// 취소 계열 에러인지 확인.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ExchangeError::Cancelled | ExchangeError::SlotWaitTimeout { .. }
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_connect() {
            ExchangeError::NetworkError(err.to_string())
        } else {
            ExchangeError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match &err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ExchangeError::Disconnected(err.to_string())
            }
            WsError::Capacity(_) | WsError::Protocol(_) => {
                ExchangeError::Protocol(err.to_string())
            }
            _ => ExchangeError::WebSocket(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ExchangeError::Timeout("x".into()).is_retryable());
        assert!(ExchangeError::RateLimited { status: 429 }.is_retryable());
        assert!(!ExchangeError::Cancelled.is_retryable());
        assert!(ExchangeError::Disposed("t".into()).is_fatal());
        assert!(!ExchangeError::Protocol("bad".into()).is_fatal());
        assert!(ExchangeError::SlotWaitTimeout {
            weight: 1,
            waited_ms: 10
        }
        .is_cancellation());
    }

    #[test]
    fn test_retry_delay() {
        assert_eq!(
            ExchangeError::RateLimited { status: 418 }.retry_delay_ms(),
            Some(60000)
        );
        assert_eq!(ExchangeError::Cancelled.retry_delay_ms(), None);
    }
}
