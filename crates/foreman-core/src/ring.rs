use std::collections::VecDeque;

/// A fixed-capacity append-only buffer with strict FIFO eviction.
///
/// Every operational history in the control plane (fleet events, metric
/// samples, anomalies, remediation outcomes) goes through one of these so
/// nothing grows without bound.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items. Capacity 0 is
    /// clamped to 1 so `push` always retains the newest item.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, evicting the oldest when full.
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest item, if any.
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest-first iterator.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The newest `limit` items, newest first.
    pub fn recent(&self, limit: usize) -> Vec<&T> {
        self.items.iter().rev().take(limit).collect()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Snapshot of the contents, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
