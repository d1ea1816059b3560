//! 거래소/심볼별 호가창 저장소.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::book::{ApplyOutcome, InMemoryOrderbook, DEFAULT_MAX_LEVELS};
use crate::types::{BookSide, DepthUpdate, Exchange, PriceLevel};

/// 저장소 키.
pub type BookKey = (Exchange, String);

/// 집계 직전에 떠낸 호가창 상태.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub exchange: Exchange,
    pub symbol: String,
    /// 마지막 반영 이벤트 시각 (없으면 스냅샷 시각)
    pub timestamp: DateTime<Utc>,
    /// 매수 레벨 (가격 오름차순)
    pub bids: Vec<PriceLevel>,
    /// 매도 레벨 (가격 오름차순)
    pub asks: Vec<PriceLevel>,
}

impl BookSnapshot {
    /// 방향별 뷰.
    pub fn view(&self, side: BookSide) -> &[PriceLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }
}

/// 여러 트랜스포트가 공유하는 호가창 저장소.
///
/// 심볼마다 독립적으로 잠기므로 서로 다른 심볼의 갱신은 경합하지 않습니다.
#[derive(Debug)]
pub struct OrderBookStore {
    books: DashMap<BookKey, InMemoryOrderbook>,
    max_levels: usize,
}

impl Default for OrderBookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBookStore {
    pub fn new() -> Self {
        Self::with_max_levels(DEFAULT_MAX_LEVELS)
    }

    /// 방향별 최대 레벨 수를 지정하여 생성합니다.
    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            books: DashMap::new(),
            max_levels,
        }
    }

    /// 갱신을 해당 호가창에 적용합니다. 호가창이 없으면 만듭니다.
    pub fn apply(&self, update: &DepthUpdate) -> ApplyOutcome {
        let max_levels = self.max_levels;
        let mut book = self
            .books
            .entry((update.exchange, update.symbol.clone()))
            .or_insert_with(|| {
                InMemoryOrderbook::new(update.exchange, update.symbol.clone())
                    .with_max_levels(max_levels)
            });
        book.apply(update)
    }

    /// 재동기화가 필요하다고 표시합니다.
    pub fn mark_unsynced(&self, exchange: Exchange, symbol: &str) {
        if let Some(mut book) = self.books.get_mut(&(exchange, symbol.to_string())) {
            book.mark_unsynced();
        }
    }

    /// 동기화 상태. 호가창이 없으면 `None`.
    pub fn is_synced(&self, exchange: Exchange, symbol: &str) -> Option<bool> {
        self.books
            .get(&(exchange, symbol.to_string()))
            .map(|book| book.is_synced())
    }

    /// 호가창을 제거합니다.
    pub fn remove(&self, exchange: Exchange, symbol: &str) -> bool {
        self.books.remove(&(exchange, symbol.to_string())).is_some()
    }

    /// 읽기 전용으로 호가창에 접근합니다.
    pub fn with_book<R>(
        &self,
        exchange: Exchange,
        symbol: &str,
        f: impl FnOnce(&InMemoryOrderbook) -> R,
    ) -> Option<R> {
        self.books
            .get(&(exchange, symbol.to_string()))
            .map(|book| f(&book))
    }

    /// 저장된 호가창 키 목록 (정렬됨).
    pub fn keys(&self) -> Vec<BookKey> {
        let mut keys: Vec<BookKey> = self.books.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// 한 호가창의 뷰를 떠내고 통계를 초기화합니다.
    pub fn take_snapshot(&self, exchange: Exchange, symbol: &str) -> Option<BookSnapshot> {
        self.books
            .get_mut(&(exchange, symbol.to_string()))
            .map(|mut book| snapshot_and_reset(&mut book))
    }

    /// 모든 호가창의 뷰를 떠내고 통계를 초기화합니다.
    ///
    /// 한 번도 갱신을 받지 않은 호가창은 건너뜁니다.
    pub fn drain_snapshots(&self) -> Vec<BookSnapshot> {
        let mut snapshots: Vec<BookSnapshot> = self
            .books
            .iter_mut()
            .filter(|book| book.update_count() > 0)
            .map(|mut book| snapshot_and_reset(&mut book))
            .collect();
        snapshots.sort_by(|a, b| (a.exchange, &a.symbol).cmp(&(b.exchange, &b.symbol)));
        snapshots
    }
}

fn snapshot_and_reset(book: &mut InMemoryOrderbook) -> BookSnapshot {
    let snapshot = BookSnapshot {
        exchange: book.exchange(),
        symbol: book.symbol().to_string(),
        timestamp: book.last_event_time().unwrap_or_else(Utc::now),
        bids: book.view(BookSide::Bid),
        asks: book.view(BookSide::Ask),
    };
    book.reset_statistics();
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DepthKind, LevelUpdate};

    fn update(exchange: Exchange, symbol: &str, bid: (f64, f64)) -> DepthUpdate {
        let mut update = DepthUpdate::new(exchange, symbol, DepthKind::Snapshot);
        update.bids.push(LevelUpdate::new(bid.0, bid.1));
        update
    }

    #[test]
    fn test_store_creates_books_on_demand() {
        let store = OrderBookStore::new();
        assert!(store.is_empty());
        store.apply(&update(Exchange::Okx, "BTC-USDT", (100.0, 1.0)));
        store.apply(&update(Exchange::Binance, "BTCUSDT", (100.0, 1.0)));
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.keys(),
            vec![
                (Exchange::Binance, "BTCUSDT".to_string()),
                (Exchange::Okx, "BTC-USDT".to_string())
            ]
        );
        assert_eq!(store.is_synced(Exchange::Okx, "BTC-USDT"), Some(true));
        store.mark_unsynced(Exchange::Okx, "BTC-USDT");
        assert_eq!(store.is_synced(Exchange::Okx, "BTC-USDT"), Some(false));
        assert_eq!(store.is_synced(Exchange::Ftx, "BTC-PERP"), None);
    }

    #[test]
    fn test_snapshot_resets_statistics() {
        let store = OrderBookStore::new();
        store.apply(&update(Exchange::Ftx, "BTC-PERP", (100.0, 1.0)));

        let snapshot = store.take_snapshot(Exchange::Ftx, "BTC-PERP").unwrap();
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.view(BookSide::Bid)[0].change_counter, 1);
        assert!(snapshot.asks.is_empty());

        let counter = store
            .with_book(Exchange::Ftx, "BTC-PERP", |book| book.view(BookSide::Bid)[0].change_counter)
            .unwrap();
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_drain_sorted_by_key() {
        let store = OrderBookStore::new();
        store.apply(&update(Exchange::Okx, "ETH-USDT", (10.0, 1.0)));
        store.apply(&update(Exchange::Okx, "BTC-USDT", (100.0, 1.0)));
        let snapshots = store.drain_snapshots();
        let symbols: Vec<&str> = snapshots.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTC-USDT", "ETH-USDT"]);
        assert!(store.remove(Exchange::Okx, "BTC-USDT"));
        assert!(!store.remove(Exchange::Okx, "BTC-USDT"));
    }
}
