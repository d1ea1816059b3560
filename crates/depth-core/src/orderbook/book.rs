//! 단일 심볼의 인메모리 호가창.
//!
//! 각 방향을 `BTreeMap<OrderedFloat<f64>, _>`로 유지하므로 뷰는 항상
//! 가격 오름차순입니다. 레벨마다 마지막 반영 update id를 기록하여
//! 늦게 도착한 스냅샷이 더 최신 증분을 덮어쓰지 않도록 합니다.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use tracing::debug;

use crate::types::{BookSide, DepthKind, DepthUpdate, Exchange, LevelUpdate, PriceLevel};

/// 한 방향에 유지하는 최대 레벨 수 기본값.
pub const DEFAULT_MAX_LEVELS: usize = 5000;

/// 갱신 적용 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 반영됨
    Applied,
    /// 이미 반영된 update id 이하라서 무시됨
    Stale,
    /// 시퀀스 갭 발견 (반영은 되었지만 재동기화 필요)
    Gap {
        /// 기대한 첫 update id
        expected: u64,
        /// 실제로 받은 첫 update id
        received: u64,
    },
}

impl ApplyOutcome {
    /// 재동기화가 필요한지 여부.
    pub fn needs_resync(&self) -> bool {
        matches!(self, ApplyOutcome::Gap { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct BookEntry {
    level: PriceLevel,
    update_id: u64,
}

impl BookEntry {
    fn new(price: f64) -> Self {
        Self {
            level: PriceLevel::new(price, 0.0),
            update_id: 0,
        }
    }

    fn record(&mut self, quantity: f64, update_id: u64) {
        self.level.quantity = quantity;
        self.level.change_counter = self.level.change_counter.saturating_add(1);
        self.level.stats.push(quantity);
        self.update_id = update_id;
    }
}

type Side = BTreeMap<OrderedFloat<f64>, BookEntry>;

/// 단일 심볼 호가창.
#[derive(Debug, Clone)]
pub struct InMemoryOrderbook {
    exchange: Exchange,
    symbol: String,
    bids: Side,
    asks: Side,
    last_update_id: Option<u64>,
    synced: bool,
    last_event_time: Option<DateTime<Utc>>,
    update_count: u64,
    max_levels: usize,
}

impl InMemoryOrderbook {
    /// 빈 호가창을 생성합니다.
    pub fn new(exchange: Exchange, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            bids: Side::new(),
            asks: Side::new(),
            last_update_id: None,
            synced: false,
            last_event_time: None,
            update_count: 0,
            max_levels: DEFAULT_MAX_LEVELS,
        }
    }

    /// 방향별 최대 레벨 수를 지정합니다.
    pub fn with_max_levels(mut self, max_levels: usize) -> Self {
        self.max_levels = max_levels.max(1);
        self
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// 마지막으로 반영한 update id.
    pub fn last_update_id(&self) -> Option<u64> {
        self.last_update_id
    }

    /// 스냅샷 이후 갭 없이 이어지고 있는지 여부.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// 재동기화가 필요하다고 표시합니다.
    pub fn mark_unsynced(&mut self) {
        self.synced = false;
    }

    /// 지금까지 반영된 이벤트 중 가장 늦은 시각.
    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_time
    }

    /// 반영된 갱신 수.
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// (매수 레벨 수, 매도 레벨 수).
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// 최우선 매수 호가.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .values()
            .rev()
            .find(|e| e.level.is_valid())
            .map(|e| e.level)
    }

    /// 최우선 매도 호가.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .values()
            .find(|e| e.level.is_valid())
            .map(|e| e.level)
    }

    /// 갱신을 적용합니다.
    pub fn apply(&mut self, update: &DepthUpdate) -> ApplyOutcome {
        let outcome = match update.kind {
            DepthKind::Snapshot => self.apply_snapshot(update),
            DepthKind::Delta => self.apply_delta(update),
        };

        if outcome != ApplyOutcome::Stale {
            self.update_count += 1;
            self.last_event_time = Some(match self.last_event_time {
                Some(prev) if prev > update.event_time => prev,
                _ => update.event_time,
            });
        }
        outcome
    }

    fn apply_snapshot(&mut self, update: &DepthUpdate) -> ApplyOutcome {
        let update_id = update.last_update_id.unwrap_or(0);
        apply_snapshot_side(&mut self.bids, &update.bids, update_id);
        apply_snapshot_side(&mut self.asks, &update.asks, update_id);

        self.last_update_id = match (self.last_update_id, update.last_update_id) {
            (Some(prev), Some(id)) => Some(prev.max(id)),
            (prev, id) => id.or(prev),
        };
        self.synced = true;
        ApplyOutcome::Applied
    }

    fn apply_delta(&mut self, update: &DepthUpdate) -> ApplyOutcome {
        if let (Some(last), Some(final_id)) = (self.last_update_id, update.last_update_id) {
            if final_id <= last {
                return ApplyOutcome::Stale;
            }
        }

        let mut outcome = ApplyOutcome::Applied;
        if self.synced {
            if let (Some(last), Some(first)) = (self.last_update_id, update.first_update_id) {
                if first > last + 1 {
                    debug!(
                        exchange = %self.exchange,
                        symbol = %self.symbol,
                        expected = last + 1,
                        received = first,
                        "Sequence gap detected"
                    );
                    self.synced = false;
                    outcome = ApplyOutcome::Gap {
                        expected: last + 1,
                        received: first,
                    };
                }
            }
        }

        let update_id = update.last_update_id.unwrap_or(0);
        for level in &update.bids {
            apply_level(&mut self.bids, level, update_id);
        }
        for level in &update.asks {
            apply_level(&mut self.asks, level, update_id);
        }

        if let Some(final_id) = update.last_update_id {
            self.last_update_id = Some(self.last_update_id.map_or(final_id, |l| l.max(final_id)));
        }
        outcome
    }

    /// 한 방향의 가격 오름차순 뷰.
    pub fn view(&self, side: BookSide) -> Vec<PriceLevel> {
        let levels = match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        };
        levels.values().map(|e| e.level).collect()
    }

    /// 통계를 초기화하고 수량 0 레벨과 한도를 넘는 먼 레벨을 정리합니다.
    pub fn reset_statistics(&mut self) {
        for side in [&mut self.bids, &mut self.asks] {
            side.retain(|_, e| e.level.quantity > 0.0);
            for entry in side.values_mut() {
                entry.level.change_counter = 0;
                entry.level.stats = Default::default();
            }
        }

        // 매수는 높은 가격, 매도는 낮은 가격이 우선
        while self.bids.len() > self.max_levels {
            self.bids.pop_first();
        }
        while self.asks.len() > self.max_levels {
            self.asks.pop_last();
        }
    }
}

fn apply_level(side: &mut Side, update: &LevelUpdate, update_id: u64) {
    if !(update.price.is_finite() && update.price > 0.0) {
        return;
    }
    let key = OrderedFloat(update.price);
    match side.get_mut(&key) {
        Some(entry) => {
            if update_id < entry.update_id {
                return;
            }
            if update.quantity <= 0.0
                && entry.level.change_counter == 0
                && update_id != entry.update_id
            {
                side.remove(&key);
            } else {
                entry.record(update.quantity.max(0.0), update_id);
            }
        }
        None if update.quantity > 0.0 => {
            let mut entry = BookEntry::new(update.price);
            entry.record(update.quantity, update_id);
            side.insert(key, entry);
        }
        None => {}
    }
}

fn apply_snapshot_side(side: &mut Side, levels: &[LevelUpdate], update_id: u64) {
    let present: BTreeSet<OrderedFloat<f64>> = levels
        .iter()
        .filter(|l| l.quantity > 0.0)
        .map(|l| OrderedFloat(l.price))
        .collect();
    for level in levels {
        apply_level(side, level, update_id);
    }
    side.retain(|price, e| present.contains(price) || e.update_id > update_id);
}
