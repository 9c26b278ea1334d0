//! A size-bounded multiset retaining the K smallest-keyed elements.

use itertools::Itertools;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Keeps at most `capacity` elements with the smallest keys.
///
/// When an insert pushes the size past the bound, the largest-keyed element
/// is evicted; among equal keys the most recently inserted is evicted first,
/// so the earliest `capacity` inserts of a tied run survive.
pub struct BoundedBestSet<T> {
    heap: BinaryHeap<Entry<T>>,
    capacity: usize,
    next_seq: u64,
}

struct Entry<T> {
    key: f64,
    seq: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key.total_cmp(&other.key) == Ordering::Equal && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap over (key, seq): the heap top is the eviction victim.
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<T> BoundedBestSet<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedBestSet {
            heap: BinaryHeap::with_capacity(capacity.saturating_add(1)),
            capacity,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Inserts `value` with the given key. O(log K).
    pub fn insert(&mut self, key: f64, value: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.capacity == 0 {
            return;
        }
        self.heap.push(Entry { key, seq, value });
        if self.heap.len() > self.capacity {
            self.heap.pop();
        }
        debug_assert!(self.heap.len() <= self.capacity);
    }

    /// Consumes the set, returning elements in ascending key order (ties in
    /// insertion order).
    pub fn into_sorted_vec(self) -> Vec<(f64, T)> {
        let mut entries = self.heap.into_vec();
        entries.sort_by(|a, b| a.cmp(b));
        debug_assert!(entries.iter().tuple_windows().all(|(a, b)| a <= b));
        entries.into_iter().map(|e| (e.key, e.value)).collect()
    }
}
