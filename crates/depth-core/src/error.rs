//! 호가 수집 시스템의 핵심 에러 타입.
//!
//! 이 모듈은 도메인 계층(호가창, 집계, 설정)에서 사용되는 에러 타입을 정의합니다.

use thiserror::Error;

/// 핵심 도메인 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 호가창 동기화 에러 (시퀀스 갭 등)
    #[error("호가창 동기화 에러: {0}")]
    OutOfSync(String),

    /// 잘못된 입력
    #[error("잘못된 입력: {0}")]
    InvalidInput(String),

    /// 찾을 수 없음
    #[error("찾을 수 없음: {0}")]
    NotFound(String),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),

    /// 내부 에러
    #[error("내부 에러: {0}")]
    Internal(String),
}

/// 핵심 작업을 위한 Result 타입.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// 재동기화로 복구 가능한 에러인지 확인합니다.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::OutOfSync(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}
