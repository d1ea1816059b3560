//! 거래소 디코더가 만들어내는 호가 갱신 이벤트.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Exchange;

/// 스냅샷 또는 증분 갱신.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthKind {
    /// 전체 호가 스냅샷 (기존 상태를 대체)
    Snapshot,
    /// 증분 갱신 (수량 0은 레벨 삭제)
    Delta,
}

/// 한 가격 레벨의 갱신.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelUpdate {
    /// 가격
    pub price: f64,
    /// 새 수량 (0이면 삭제)
    pub quantity: f64,
}

impl LevelUpdate {
    /// 새 레벨 갱신.
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

/// 심볼 하나의 호가 갱신.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    /// 거래소
    pub exchange: Exchange,
    /// 거래소 고유 심볼 (예: BTCUSDT, BTC-USDT, BTC-PERP)
    pub symbol: String,
    /// 스냅샷/증분 구분
    pub kind: DepthKind,
    /// 이 갱신이 덮는 첫 update id (Binance `U`)
    pub first_update_id: Option<u64>,
    /// 이 갱신이 덮는 마지막 update id (Binance `u`, 스냅샷 `lastUpdateId`)
    pub last_update_id: Option<u64>,
    /// 거래소 이벤트 시각
    pub event_time: DateTime<Utc>,
    /// 매수 호가 갱신
    pub bids: Vec<LevelUpdate>,
    /// 매도 호가 갱신
    pub asks: Vec<LevelUpdate>,
}

impl DepthUpdate {
    /// 빈 갱신을 생성합니다.
    pub fn new(exchange: Exchange, symbol: impl Into<String>, kind: DepthKind) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            kind,
            first_update_id: None,
            last_update_id: None,
            event_time: Utc::now(),
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// update id 범위를 지정합니다.
    pub fn with_update_ids(mut self, first: u64, last: u64) -> Self {
        self.first_update_id = Some(first);
        self.last_update_id = Some(last);
        self
    }

    /// 이벤트 시각을 지정합니다.
    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }
}
