//! 수집 통계 구조체.

use depth_exchange::DispatchReport;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 집계 주기 통계
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    /// 실행한 집계 주기 수
    pub cycles: usize,
    /// 실패한 집계 주기 수
    pub errors: usize,
    /// 갱신이 없어 건너뛴 주기 수
    pub skipped: usize,
    /// 집계한 호가창 수 (누적)
    pub books: usize,
    /// 싱크에 전달된 배치 수
    pub delivered: usize,
    /// 싱크 실패 수
    pub sink_failures: usize,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl CollectionStats {
    /// 새 통계 객체 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 디스패치 결과 반영
    pub fn record_dispatch(&mut self, books: usize, report: &DispatchReport) {
        self.cycles += 1;
        self.books += books;
        self.delivered += report.delivered;
        self.sink_failures += report.failed;
    }

    /// 성공률 계산 (%)
    pub fn success_rate(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            ((self.cycles - self.errors.min(self.cycles)) as f64 / self.cycles as f64) * 100.0
        }
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            cycles = self.cycles,
            errors = self.errors,
            skipped = self.skipped,
            books = self.books,
            delivered = self.delivered,
            sink_failures = self.sink_failures,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "Collection summary"
        );
    }
}
