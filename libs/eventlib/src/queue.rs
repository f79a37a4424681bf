// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Lock-free queues and the batch lookup table
//!
//! Three primitives back the data path:
//!
//! - [`InFlightQueue`]: bounded queue of started batches, pushed by the
//!   contribution thread and drained by the result thread. Overflow is an
//!   error surfaced to the caller; it means design-level flow control broke.
//! - [`CreditQueue`]: buffer-free credits flowing from monitor consumers back
//!   to the request issuer. An empty pop means "no credit"; the caller skips
//!   the request.
//! - [`IndexLut`]: a table of records indexed by `(key & mask) % size`.
//!   Collisions are impossible by construction because the table is sized to
//!   the maximum legal outstanding window.

use crossbeam_queue::ArrayQueue;

use crate::error::{EbError, Result};

/// Bounded queue of in-flight work.
///
/// Capacity must exceed the product of maximum in-flight batches and peers;
/// a push that would overflow is surfaced as a capacity error.
pub struct InFlightQueue<T> {
    queue: ArrayQueue<T>,
}

impl<T> InFlightQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.queue
            .push(item)
            .map_err(|_| EbError::Capacity("in-flight queue overflow".into()))
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.queue.pop())
    }
}

/// Bounded queue of free-buffer credits.
pub struct CreditQueue {
    queue: ArrayQueue<u32>,
}

impl CreditQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    pub fn push(&self, index: u32) -> Result<()> {
        self.queue
            .push(index)
            .map_err(|_| EbError::Capacity("credit queue overflow".into()))
    }

    /// `None` means no credit is available; the caller must skip the request.
    pub fn pop(&self) -> Option<u32> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// Record table indexed by a masked key.
///
/// The table must be sized to the maximum number of keys simultaneously
/// outstanding; under that contract two live keys never map to the same
/// slot, so no collision handling exists.
pub struct IndexLut<T> {
    slots: Vec<Option<T>>,
    mask: u64,
}

impl<T> IndexLut<T> {
    /// `size` must be a power of two.
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "LUT size must be a power of two");
        Self {
            slots: (0..size).map(|_| None).collect(),
            mask: size as u64 - 1,
        }
    }

    fn slot(&self, key: u64) -> usize {
        (key & self.mask) as usize
    }

    /// Insert a record for `key`, returning the displaced record if the slot
    /// was occupied (a displaced record indicates a window violation).
    pub fn insert(&mut self, key: u64, value: T) -> Option<T> {
        let slot = self.slot(key);
        self.slots[slot].replace(value)
    }

    pub fn get(&self, key: u64) -> Option<&T> {
        self.slots[self.slot(key)].as_ref()
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        let slot = self.slot(key);
        self.slots[slot].as_mut()
    }

    pub fn take(&mut self, key: u64) -> Option<T> {
        let slot = self.slot(key);
        self.slots[slot].take()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.slots[self.slot(key)].is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_overflow_is_error() {
        let q: InFlightQueue<u32> = InFlightQueue::new(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert!(q.push(3).is_err());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_credit_queue_empty_pop() {
        let q = CreditQueue::new(4);
        assert_eq!(q.pop(), None);
        q.push(3).unwrap();
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_lut_masked_indexing() {
        let mut lut: IndexLut<&str> = IndexLut::new(8);
        assert!(lut.insert(3, "a").is_none());
        assert_eq!(lut.get(3), Some(&"a"));
        // Key 11 maps to the same slot; inserting it displaces "a", which
        // is only legal once key 3 has retired.
        assert_eq!(lut.take(3), Some("a"));
        assert!(lut.insert(11, "b").is_none());
        assert_eq!(lut.get(11), Some(&"b"));
        assert_eq!(lut.len(), 1);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_lut_rejects_non_power_of_two() {
        let _lut: IndexLut<u32> = IndexLut::new(6);
    }
}
