//! 집계 결과 행.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Exchange;

/// 브레이크포인트 하나와 그 사이 레벨들을 요약한 항목.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEntry {
    /// 브레이크포인트 가격
    pub price: f64,
    /// 묶인 레벨들의 수량 합
    pub size: f64,
    /// 브레이크포인트 레벨 자체의 수량
    pub raw_size: f64,
    /// 수량 가중 평균 가격
    pub mean_price: f64,
    /// 브레이크포인트 레벨의 변경 횟수
    pub change_counter: u32,
    /// 묶인 레벨들의 변경 횟수 합
    pub total_change_counter: u32,
    /// 수량 표준편차의 평활 값
    pub size_std: f64,
    /// 묶인 레벨 수
    pub aggregate_count: u32,
}

impl AggregatedEntry {
    /// 유동성 없이 가격만 채운 항목 (고정 폭 유지용).
    pub fn filler(price: f64) -> Self {
        Self {
            price,
            mean_price: price,
            ..Default::default()
        }
    }
}

/// 고정 크기 집계 행 (한쪽 호가).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    entries: Vec<AggregatedEntry>,
}

impl AggregatedRow {
    /// 항목 목록으로 생성합니다.
    pub fn from_entries(entries: Vec<AggregatedEntry>) -> Self {
        Self { entries }
    }

    /// `size`개의 0 항목으로 채운 행.
    pub fn zeroed(size: usize) -> Self {
        Self {
            entries: vec![AggregatedEntry::default(); size],
        }
    }

    /// 항목 수.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 비어 있는지 여부.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 항목 슬라이스.
    pub fn entries(&self) -> &[AggregatedEntry] {
        &self.entries
    }

    /// 전체 수량 합.
    pub fn total_size(&self) -> f64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

impl std::ops::Index<usize> for AggregatedRow {
    type Output = AggregatedEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

/// 양쪽 호가 집계.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideRows {
    /// 매수 집계 (가격 오름차순)
    pub bids: AggregatedRow,
    /// 매도 집계 (가격 오름차순)
    pub asks: AggregatedRow,
}

/// 심볼 하나의 집계 결과 (양쪽 호가).
///
/// 싱크가 타임스탬프를 키로 저장하는 단위입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRow {
    /// 거래소
    pub exchange: Exchange,
    /// 거래소 고유 심볼
    pub symbol: String,
    /// 마지막 반영 이벤트 시각
    pub timestamp: DateTime<Utc>,
    /// 매수 집계 (가격 오름차순)
    pub bids: AggregatedRow,
    /// 매도 집계 (가격 오름차순)
    pub asks: AggregatedRow,
}

impl BookRow {
    /// 양쪽 집계로 행을 구성합니다.
    pub fn new(
        exchange: Exchange,
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        rows: SideRows,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            timestamp,
            bids: rows.bids,
            asks: rows.asks,
        }
    }
}
