//! 가격 레벨과 레벨별 누적 통계.

use serde::{Deserialize, Serialize};

/// 레벨 수량의 누적 통계 (Welford).
///
/// 집계 주기마다 초기화되며, 주기 동안 해당 가격에 찍힌 수량들의
/// 평균과 분산을 유지합니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    /// 빈 통계.
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// 샘플을 추가합니다.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// 샘플 수.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 평균. 샘플이 없으면 0.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// 모분산. 샘플이 없으면 0.
    pub fn population_variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    /// 표본분산. 샘플이 2개 미만이면 0.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// 모표준편차.
    pub fn population_std_dev(&self) -> f64 {
        self.population_variance().sqrt()
    }

    /// 표본표준편차.
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// 호가창 한쪽의 가격 레벨.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// 가격
    pub price: f64,
    /// 현재 수량
    pub quantity: f64,
    /// 마지막 통계 초기화 이후 변경 횟수
    pub change_counter: u32,
    /// 수량 누적 통계
    pub stats: RunningStats,
}

impl PriceLevel {
    /// 통계 없는 레벨을 생성합니다.
    pub fn new(price: f64, quantity: f64) -> Self {
        Self {
            price,
            quantity,
            change_counter: 0,
            stats: RunningStats::new(),
        }
    }

    /// 집계 후보가 될 수 있는 레벨인지 (가격과 수량이 모두 양수).
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.price > 0.0 && self.quantity > 0.0
    }
}
