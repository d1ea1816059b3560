//! 라우팅 키 intern 캐시.
//!
//! 같은 심볼 이름이 초당 수천 번 추출되므로, 짧은 키는 한 번만 할당하고
//! `Arc<str>`를 공유합니다. 여러 전송 계층이 동시에 사용합니다.

use dashmap::DashMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::RoutingKey;

/// 캐시 대상 최대 키 길이 (바이트).
pub const MAX_INTERNED_LEN: usize = 16;

/// 기본 최대 항목 수.
pub const DEFAULT_INTERN_CAPACITY: usize = 16_384;

struct InternEntry {
    key: Arc<str>,
    hits: AtomicU32,
}

/// 내용 해시로 키를 찾는 동시성 intern 캐시.
///
/// 가득 차면 조회 빈도가 낮은 절반을 제거하고, 남은 항목의 빈도를 절반으로 줄여
/// 오래된 인기 키가 영구히 남지 않게 합니다.
pub struct InternCache {
    entries: DashMap<u64, InternEntry>,
    hasher: RandomState,
    capacity: usize,
    evictions: AtomicU64,
}

impl InternCache {
    /// 최대 항목 수를 지정해 생성합니다.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            hasher: RandomState::new(),
            capacity: capacity.max(2),
            evictions: AtomicU64::new(0),
        }
    }

    /// 프로세스 전역 캐시.
    pub fn shared() -> &'static InternCache {
        static SHARED: OnceLock<InternCache> = OnceLock::new();
        SHARED.get_or_init(|| InternCache::new(DEFAULT_INTERN_CAPACITY))
    }

    /// 키를 intern합니다. 긴 키와 해시 충돌은 새로 할당합니다.
    pub fn intern(&self, value: &str) -> RoutingKey {
        if value.len() > MAX_INTERNED_LEN {
            return Arc::from(value);
        }

        let hash = self.hasher.hash_one(value);
        if let Some(entry) = self.entries.get(&hash) {
            if &*entry.key == value {
                let _ = entry
                    .hits
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| h.checked_add(1));
                return entry.key.clone();
            }
            return Arc::from(value);
        }

        if self.entries.len() >= self.capacity {
            self.evict();
        }

        let entry = self.entries.entry(hash).or_insert_with(|| InternEntry {
            key: Arc::from(value),
            hits: AtomicU32::new(1),
        });
        if &*entry.key == value {
            entry.key.clone()
        } else {
            Arc::from(value)
        }
    }

    fn evict(&self) {
        let mut by_hits: Vec<(u64, u32)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.hits.load(Ordering::Relaxed)))
            .collect();
        by_hits.sort_unstable_by_key(|&(_, hits)| hits);

        let remove = (by_hits.len() / 2).max(1);
        for (hash, _) in by_hits.iter().take(remove) {
            self.entries.remove(hash);
        }
        for entry in self.entries.iter() {
            let hits = entry.hits.load(Ordering::Relaxed);
            entry.hits.store(hits / 2, Ordering::Relaxed);
        }

        let evictions = self.evictions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(removed = remove, remaining = self.entries.len(), evictions, "Intern cache evicted");
    }

    /// 현재 항목 수.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 비어 있는지 여부.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 최대 항목 수.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 지금까지의 축출 횟수.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for InternCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_shares_allocation() {
        let cache = InternCache::new(64);
        let a = cache.intern("BTC-PERP");
        let b = cache.intern("BTC-PERP");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_long_keys_not_cached() {
        let cache = InternCache::new(64);
        let long = "a-very-long-instrument-name";
        let a = cache.intern(long);
        let b = cache.intern(long);
        assert_eq!(a, b);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_keeps_hot_keys() {
        let cache = InternCache::new(8);
        let hot = cache.intern("HOT");
        for _ in 0..20 {
            cache.intern("HOT");
        }
        for i in 0..7 {
            cache.intern(&format!("K{}", i));
        }
        assert_eq!(cache.len(), 8);

        // 가득 찬 상태에서 새 키가 들어오면 절반이 제거됨
        cache.intern("NEW");
        assert!(cache.len() <= 5);
        assert_eq!(cache.evictions(), 1);
        assert!(Arc::ptr_eq(&hot, &cache.intern("HOT")));
    }

    #[test]
    fn test_shared_instance() {
        let a = InternCache::shared().intern("ETHUSDT");
        let b = InternCache::shared().intern("ETHUSDT");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
