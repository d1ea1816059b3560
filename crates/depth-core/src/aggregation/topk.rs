//! 고정 용량 top-K 선택.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// 가장 큰 `capacity`개의 항목만 유지하는 컬렉션.
///
/// 내부적으로 최소 힙을 사용하므로 삽입은 `O(log K)`입니다.
#[derive(Debug, Clone)]
pub struct TopK<T: Ord> {
    capacity: usize,
    heap: BinaryHeap<Reverse<T>>,
}

impl<T: Ord> TopK<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    /// 항목을 추가합니다. 용량이 찼으면 현재 최솟값보다 클 때만 교체합니다.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(item));
            return;
        }
        if let Some(Reverse(min)) = self.heap.peek() {
            if item > *min {
                self.heap.pop();
                self.heap.push(Reverse(item));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// 내림차순으로 정렬된 항목.
    pub fn into_sorted_vec(self) -> Vec<T> {
        // Reverse 기준 오름차순 = 원래 값 기준 내림차순
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(item)| item)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topk_keeps_largest() {
        let mut topk = TopK::new(3);
        for value in [5, 1, 9, 3, 7, 2] {
            topk.push(value);
        }
        assert_eq!(topk.len(), 3);
        assert_eq!(topk.into_sorted_vec(), vec![9, 7, 5]);
    }

    #[test]
    fn test_topk_zero_capacity() {
        let mut topk = TopK::new(0);
        topk.push(1);
        assert!(topk.is_empty());
    }

    #[test]
    fn test_topk_tuple_tie_break() {
        let mut topk = TopK::new(2);
        topk.push((1, -5));
        topk.push((1, -1));
        topk.push((1, -3));
        assert_eq!(topk.into_sorted_vec(), vec![(1, -1), (1, -3)]);
    }
}
