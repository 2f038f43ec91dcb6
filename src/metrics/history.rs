//! Bounded sample histories

use std::collections::VecDeque;

/// Fixed-capacity FIFO buffer; pushing past capacity evicts the oldest entry
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an item, returning the evicted one if the buffer was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Newest item
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Up to `n` newest items, oldest first
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of stored items
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut buffer = RingBuffer::new(3);
        for value in 1..=3 {
            assert!(buffer.push(value).is_none());
        }
        assert_eq!(buffer.push(4), Some(1));
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buffer.latest(), Some(&4));
    }

    #[test]
    fn test_last_n_keeps_order() {
        let mut buffer = RingBuffer::new(10);
        for value in 0..6 {
            buffer.push(value);
        }
        assert_eq!(buffer.last_n(3).copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(buffer.last_n(50).count(), 6);
    }
}
