//! 호가창 한쪽을 고정 크기 행으로 축약하는 top-K 집계기.
//!
//! 동작 순서:
//! 1. 뷰를 한 번 순회하며 변경 횟수, 거래량, 분산 기준 top-K를 각각 구합니다.
//! 2. 세 집합의 합집합에 기준 인덱스(최우선 호가)를 더하고, `size`를 넘으면
//!    기준 인덱스를 제외한 나머지에서 무작위로 `size - 1`개를 뽑습니다.
//! 3. 최우선 호가 쪽부터 브레이크포인트를 따라가며 다음 브레이크포인트 직전까지의
//!    레벨을 하나의 항목으로 묶습니다.
//! 4. 남는 칸은 마지막 가격을 반복하고 수량 0으로 채웁니다.
//!
//! 매도는 인덱스 0, 매수는 마지막 인덱스가 최우선 호가이며, 결과는 양쪽 모두
//! 가격 오름차순입니다.

use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::topk::TopK;
use crate::orderbook::BookSnapshot;
use crate::types::{AggregatedEntry, AggregatedRow, BookRow, BookSide, PriceLevel, SideRows};

/// 변경 필터를 적용한 결과가 `size`의 이 비율에 못 미치면 필터 없이 다시 계산합니다.
pub const COVERAGE_FALLBACK: f64 = 0.8;

/// 분산 top-K 후보가 되기 위한 최소 샘플 수.
pub const MIN_VARIANCE_SAMPLES: u64 = 3;

const INTERMEDIATE_STD_MIN_SAMPLES: u64 = 5;
const BREAKPOINT_STD_MIN_SAMPLES: u64 = 4;

/// top-K 집계기.
#[derive(Debug, Clone)]
pub struct OrderbookAggregator {
    size: usize,
    rng: SmallRng,
}

impl OrderbookAggregator {
    /// 엔트로피로 시드한 집계기를 생성합니다.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            rng: SmallRng::from_entropy(),
        }
    }

    /// 고정 시드 집계기. 같은 뷰와 같은 시드는 같은 결과를 냅니다.
    pub fn with_seed(size: usize, seed: u64) -> Self {
        Self {
            size: size.max(1),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// 설정의 시드가 있으면 고정 시드로, 없으면 엔트로피로 생성합니다.
    pub fn from_seed_option(size: usize, seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::with_seed(size, seed),
            None => Self::new(size),
        }
    }

    /// 출력 행 크기.
    pub fn size(&self) -> usize {
        self.size
    }

    /// 한쪽 호가를 집계합니다.
    pub fn aggregate(&mut self, view: &[PriceLevel], side: BookSide) -> AggregatedRow {
        let size = self.size;
        aggregate_with_rng(view, side, size, &mut self.rng)
    }

    /// 양쪽 호가를 집계합니다.
    pub fn aggregate_sides(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) -> SideRows {
        SideRows {
            bids: self.aggregate(bids, BookSide::Bid),
            asks: self.aggregate(asks, BookSide::Ask),
        }
    }

    /// 저장소에서 떠낸 호가창 상태를 행으로 만듭니다.
    pub fn aggregate_book(&mut self, book: &BookSnapshot) -> BookRow {
        let rows = self.aggregate_sides(&book.bids, &book.asks);
        BookRow::new(book.exchange, book.symbol.clone(), book.timestamp, rows)
    }
}

/// 주어진 난수 생성기로 한쪽 호가를 집계합니다.
pub fn aggregate_with_rng<R: Rng + ?Sized>(
    view: &[PriceLevel],
    side: BookSide,
    size: usize,
    rng: &mut R,
) -> AggregatedRow {
    let size = size.max(1);
    if view.is_empty() {
        return AggregatedRow::zeroed(size);
    }

    let mut entries = process_view(view, side, size, true, rng);
    if (entries.len() as f64) < COVERAGE_FALLBACK * size as f64 {
        entries = process_view(view, side, size, false, rng);
    }

    if entries.is_empty() {
        debug!(side = %side, levels = view.len(), "No valid level in view");
    }

    // 진행 방향의 마지막 가격을 반복
    let fill_price = match entries.last() {
        Some(last) => last.price,
        None => match side {
            BookSide::Ask => view[view.len() - 1].price,
            BookSide::Bid => view[0].price,
        },
    };
    entries.resize(size, AggregatedEntry::filler(fill_price));

    if side == BookSide::Bid {
        entries.reverse();
    }
    AggregatedRow::from_entries(entries)
}

/// 같은 값이면 최우선 호가에 가까운 쪽이 크도록 변환한 인덱스.
#[inline]
fn transform_index(side: BookSide, index: usize) -> i64 {
    match side {
        BookSide::Ask => -(index as i64),
        BookSide::Bid => index as i64,
    }
}

#[inline]
fn revert_index(side: BookSide, tidx: i64) -> usize {
    match side {
        BookSide::Ask => (-tidx) as usize,
        BookSide::Bid => tidx as usize,
    }
}

/// `x`의 이진 지수 (`floor(log2(x))`). 0 이하나 비유한 값은 `i32::MIN`.
#[inline]
fn ilogb(x: f64) -> i32 {
    if !(x.is_finite() && x > 0.0) {
        return i32::MIN;
    }
    let exponent = ((x.to_bits() >> 52) & 0x7ff) as i32;
    if exponent == 0 {
        // 비정규 수
        x.log2().floor() as i32
    } else {
        exponent - 1023
    }
}

type ChangeKey = (u32, i32, u32, i64);
type VolumeKey = (i32, OrderedFloat<f64>, i64);

fn select_breakpoints<R: Rng + ?Sized>(
    view: &[PriceLevel],
    side: BookSide,
    size: usize,
    filter_unchanged: bool,
    rng: &mut R,
) -> Vec<usize> {
    let mut change_topk: TopK<ChangeKey> = TopK::new(size);
    let mut volume_topk: TopK<VolumeKey> = TopK::new(size);
    let mut variance_topk: TopK<VolumeKey> = TopK::new(size);

    for (index, level) in view.iter().enumerate() {
        if !level.is_valid() || (filter_unchanged && level.change_counter == 0) {
            continue;
        }
        let tidx = transform_index(side, index);
        let volume_log = ilogb(level.quantity + 1.0);
        let mean = if level.stats.count() > 1 {
            level.stats.mean()
        } else {
            level.quantity
        };

        change_topk.push((
            (level.change_counter.saturating_add(1)).ilog2(),
            volume_log,
            level.change_counter,
            tidx,
        ));
        volume_topk.push((volume_log, OrderedFloat(mean), tidx));
        if level.stats.count() >= MIN_VARIANCE_SAMPLES {
            variance_topk.push((
                ilogb(level.stats.population_variance() + 1.0),
                OrderedFloat(level.stats.mean()),
                tidx,
            ));
        }
    }

    let anchor = match side {
        BookSide::Ask => 0,
        BookSide::Bid => view.len() - 1,
    };
    let mut seen = vec![false; view.len()];
    seen[anchor] = true;

    let mut rest = Vec::with_capacity(size * 3);
    let candidates = volume_topk
        .into_sorted_vec()
        .into_iter()
        .map(|(_, _, tidx)| tidx)
        .chain(change_topk.into_sorted_vec().into_iter().map(|k| k.3))
        .chain(variance_topk.into_sorted_vec().into_iter().map(|(_, _, tidx)| tidx));
    for tidx in candidates {
        let index = revert_index(side, tidx);
        if !seen[index] {
            seen[index] = true;
            rest.push(index);
        }
    }

    let mut flat = Vec::with_capacity(size);
    flat.push(anchor);
    if rest.len() + 1 > size {
        let picked = rand::seq::index::sample(rng, rest.len(), size - 1);
        flat.extend(picked.into_iter().map(|i| rest[i]));
    } else {
        flat.extend(rest);
    }
    flat.sort_unstable();
    flat
}

fn process_view<R: Rng + ?Sized>(
    view: &[PriceLevel],
    side: BookSide,
    size: usize,
    filter_unchanged: bool,
    rng: &mut R,
) -> Vec<AggregatedEntry> {
    let flat = select_breakpoints(view, side, size, filter_unchanged, rng);
    let mut entries = Vec::with_capacity(size);

    match side {
        BookSide::Ask => {
            let mut prev: Option<usize> = None;
            for (pos, &flat_index) in flat.iter().enumerate() {
                let start = prev.map_or(flat_index, |p| flat_index.max(p + 1));
                let Some(index) = (start..view.len()).find(|&i| view[i].is_valid()) else {
                    break;
                };
                prev = Some(index);
                let end = flat.get(pos + 1).copied().unwrap_or(view.len());
                entries.push(summarize(view, index, index + 1..end));
            }
        }
        BookSide::Bid => {
            let mut prev: Option<usize> = None;
            for pos in (0..flat.len()).rev() {
                let start = match prev {
                    Some(0) => break,
                    Some(p) => flat[pos].min(p - 1),
                    None => flat[pos],
                };
                let Some(index) = (0..=start).rev().find(|&i| view[i].is_valid()) else {
                    break;
                };
                prev = Some(index);
                let lower = if pos > 0 { flat[pos - 1] + 1 } else { 0 };
                entries.push(summarize(view, index, (lower..index).rev()));
            }
        }
    }
    entries
}

fn summarize(
    view: &[PriceLevel],
    index: usize,
    intermediates: impl Iterator<Item = usize>,
) -> AggregatedEntry {
    let breakpoint = &view[index];
    let mut sum_size = breakpoint.quantity;
    let mut sum_price_volume = breakpoint.price * breakpoint.quantity;
    let mut total_change_counter = breakpoint.change_counter;
    let mut aggregate_count = 1u32;
    let mut size_std = 0.0f64;

    for j in intermediates {
        let level = &view[j];
        if level.quantity <= 0.0 || level.price <= 0.0 {
            continue;
        }
        sum_size += level.quantity;
        sum_price_volume += level.price * level.quantity;
        total_change_counter = total_change_counter.saturating_add(level.change_counter);
        if level.stats.count() >= INTERMEDIATE_STD_MIN_SAMPLES {
            let std = level.stats.population_std_dev();
            if size_std <= 0.0 {
                size_std = std;
            }
            size_std = 0.9 * size_std + 0.1 * std;
        }
        aggregate_count += 1;
    }

    if breakpoint.stats.count() >= BREAKPOINT_STD_MIN_SAMPLES {
        let std = breakpoint.stats.std_dev();
        if size_std > 0.0 {
            if std > 0.0 {
                size_std = 0.8 * std + 0.2 * size_std;
            }
        } else {
            size_std = std;
        }
    }

    AggregatedEntry {
        price: breakpoint.price,
        size: sum_size,
        raw_size: breakpoint.quantity,
        mean_price: sum_price_volume / sum_size,
        change_counter: breakpoint.change_counter,
        total_change_counter,
        size_std,
        aggregate_count,
    }
}
