//! 벽시계 추상화.
//!
//! rate limiter의 1분 창 계산은 실제 시각(분 단위 내림)에 의존합니다.
//! 테스트에서 분 경계를 넘기기 위해 시각 공급자를 주입할 수 있게 합니다.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

/// 현재 시각 공급자.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// 현재 UTC 시각.
    fn now(&self) -> DateTime<Utc>;
}

/// 시스템 시계.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 수동으로 진행시키는 시계 (테스트용).
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// 주어진 시각에서 시작합니다.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// 유닉스 초 시각에서 시작합니다.
    pub fn at_unix(seconds: i64) -> Self {
        let start = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .unwrap_or_default();
        Self::new(start)
    }

    /// 시계를 앞으로 진행합니다.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// 시각을 지정합니다.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 유닉스 초를 60초 단위로 내림합니다.
pub fn floor_minute(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60) * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let before = clock.now();
        clock.advance(Duration::seconds(61));
        assert_eq!((clock.now() - before).num_seconds(), 61);
    }

    #[test]
    fn test_floor_minute() {
        let at = Utc.timestamp_opt(125, 0).unwrap();
        assert_eq!(floor_minute(at), 120);
        let on_boundary = Utc.timestamp_opt(180, 0).unwrap();
        assert_eq!(floor_minute(on_boundary), 180);
    }
}
