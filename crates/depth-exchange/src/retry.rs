//! 주기 작업용 재시도 정책.
//!
//! 시도 사이 대기는 `base_delay * attempt`로 선형 증가하며, 전체 시도는
//! `deadline` 안에서 끝나야 합니다. 보통 deadline은 작업 주기와 같습니다.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::traits::ExchangeResult;
use crate::ExchangeError;

/// 재시도 설정.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// 첫 시도 이후 추가 시도 횟수
    pub max_retries: u32,
    /// 선형 대기의 기본 단위
    pub base_delay: Duration,
    /// 전체 시도 제한 시간 (없으면 무제한)
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            deadline: None,
        }
    }
}

impl RetryConfig {
    /// 재시도 횟수와 전체 제한 시간으로 생성합니다.
    pub fn new(max_retries: u32, deadline: Duration) -> Self {
        Self {
            max_retries,
            deadline: Some(deadline),
            ..Default::default()
        }
    }

    /// 기본 대기 단위를 지정합니다.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// `attempt`번째 실패 후 대기 시간.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// 재시도 가능한 에러면 다시 시도합니다.
///
/// 치명적 에러나 취소는 즉시 반환하고, deadline을 넘기면 `Timeout`을 반환합니다.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, name: &str, mut op: F) -> ExchangeResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ExchangeResult<T>>,
{
    let deadline = config.deadline.map(|d| Instant::now() + d);
    let attempts = config.max_retries + 1;

    for attempt in 1..=attempts {
        let result = match deadline {
            Some(deadline) => match timeout_at(deadline, op(attempt)).await {
                Ok(result) => result,
                Err(_) => return Err(deadline_exceeded(name, attempt)),
            },
            None => op(attempt).await,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if is_final(&error) || attempt == attempts {
            warn!(task = name, attempts = attempt, error = %error, "Task failed");
            return Err(error);
        }

        let delay = config.delay_for(attempt);
        if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
            warn!(task = name, attempts = attempt, error = %error, "No time left for another attempt");
            return Err(error);
        }
        debug!(
            task = name,
            attempt = attempt,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying"
        );
        sleep(delay).await;
    }

    Err(deadline_exceeded(name, attempts))
}

fn is_final(error: &ExchangeError) -> bool {
    error.is_fatal() || matches!(error, ExchangeError::Cancelled)
}

fn deadline_exceeded(name: &str, attempt: u32) -> ExchangeError {
    warn!(task = name, attempts = attempt, "Task deadline exceeded");
    ExchangeError::Timeout(format!("{} exceeded its deadline on attempt {}", name, attempt))
}
