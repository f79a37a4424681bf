// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Batch management
//!
//! Contributions are grouped into batches by fixed-duration pulse-ID
//! windows. Windowing in pulse-ID space lets producer and consumer compute
//! the slot index without negotiation: the remote write offset for a batch
//! is simply `slot_offset(index)`, which gives zero-copy placement on the
//! receiving side.
//!
//! The manager tracks which slots are in use. A slot is claimed by
//! `fetch_blocking` when the first contribution of a window arrives and
//! returned by `release` once the corresponding result has been matched.
//! With `MAX_BATCHES` slots and the latency bound enforced upstream, a
//! claimed slot is never re-requested before it is released; when that
//! assumption breaks, `fetch_blocking` blocks until the slot frees, which
//! is the backpressure of last resort.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::datagram::NUM_TRANSITIONS;
use crate::pulse::{self, PulseId};
use crate::queue::IndexLut;

/// Sizing and policy for a batch manager.
#[derive(Debug, Clone)]
pub struct BatchManagerConfig {
    /// Width of one batch window in pulse ticks. Power of two.
    pub batch_duration: u64,
    /// Number of batch slots in circulation. Power of two.
    pub max_batches: usize,
    /// Maximum datagrams per batch.
    pub max_entries: usize,
    /// Maximum size of one contribution (header + payload).
    pub max_input_size: usize,
    /// When false, every contribution flushes its batch immediately.
    pub batching: bool,
}

impl Default for BatchManagerConfig {
    fn default() -> Self {
        Self {
            batch_duration: pulse::BATCH_DURATION,
            max_batches: pulse::MAX_BATCHES,
            max_entries: pulse::MAX_ENTRIES,
            max_input_size: 4096,
            batching: true,
        }
    }
}

/// A claimed batch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    index: u32,
    start: PulseId,
}

impl Batch {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn start(&self) -> PulseId {
        self.start
    }
}

/// Per-slot bookkeeping, recovered at release time for result matching.
#[derive(Debug)]
pub struct BatchRecord {
    pub epoch: u64,
    pub start: PulseId,
    /// Opaque per-event parameters, indexed by entry within the window.
    pub app_prms: Vec<u64>,
}

struct Inner {
    lut: IndexLut<BatchRecord>,
    stopped: bool,
}

pub struct BatchManager {
    cfg: BatchManagerConfig,
    inner: Mutex<Inner>,
    slot_freed: Condvar,
    allocs: AtomicU64,
    frees: AtomicU64,
    waiting: AtomicU64,
}

impl BatchManager {
    pub fn new(cfg: BatchManagerConfig) -> Self {
        assert!(cfg.batch_duration.is_power_of_two());
        assert!(cfg.max_batches.is_power_of_two());
        assert!(cfg.max_entries as u64 <= cfg.batch_duration);
        let lut = IndexLut::new(cfg.max_batches);
        Self {
            cfg,
            inner: Mutex::new(Inner { lut, stopped: false }),
            slot_freed: Condvar::new(),
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            waiting: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BatchManagerConfig {
        &self.cfg
    }

    /// Fetch the batch for `pid`, claiming its slot if this is the first
    /// contribution of the window.
    ///
    /// Blocks while the slot is still held by a previous cycle of the index
    /// space. Returns `None` once the manager has been stopped.
    pub fn fetch_blocking(&self, pid: PulseId) -> Option<Batch> {
        let epoch = pid.epoch(self.cfg.batch_duration);
        let index = pid.batch_index(self.cfg.batch_duration, self.cfg.max_batches);

        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            match inner.lut.get(index as u64).map(|rec| (rec.epoch, rec.start)) {
                Some((held, start)) if held == epoch => {
                    return Some(Batch { index, start });
                }
                Some(_) => {
                    // Slot held by an earlier window; wait for its release.
                    self.waiting.fetch_add(1, Ordering::Relaxed);
                    self.slot_freed.wait(&mut inner);
                    self.waiting.fetch_sub(1, Ordering::Relaxed);
                }
                None => {
                    inner.lut.insert(
                        index as u64,
                        BatchRecord {
                            epoch,
                            start: pid,
                            app_prms: vec![0; self.cfg.max_entries],
                        },
                    );
                    self.allocs.fetch_add(1, Ordering::Relaxed);
                    return Some(Batch { index, start: pid });
                }
            }
        }
    }

    /// Associate an opaque per-event parameter with `pid`'s entry.
    pub fn store(&self, pid: PulseId, app_prm: u64) {
        let index = pid.batch_index(self.cfg.batch_duration, self.cfg.max_batches);
        let entry = pid.entry(self.cfg.batch_duration) as usize;
        let mut inner = self.inner.lock();
        if let Some(rec) = inner.lut.get_mut(index as u64) {
            if entry < rec.app_prms.len() {
                rec.app_prms[entry] = app_prm;
            }
        }
    }

    /// True when `pid` no longer belongs to the batch started at `start`.
    pub fn expired(&self, pid: PulseId, start: PulseId) -> bool {
        if pid.raw().wrapping_sub(start.raw()) >= self.cfg.batch_duration {
            return true;
        }
        pid.crosses_epoch(start, self.cfg.batch_duration)
    }

    /// Return a slot to circulation, recovering its bookkeeping.
    pub fn release(&self, index: u32) -> Option<BatchRecord> {
        let rec = {
            let mut inner = self.inner.lock();
            inner.lut.take(index as u64)
        };
        if rec.is_some() {
            self.frees.fetch_add(1, Ordering::Relaxed);
            self.slot_freed.notify_all();
        }
        rec
    }

    /// Unblock all pending `fetch_blocking` callers with `None`.
    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        self.slot_freed.notify_all();
    }

    /// Re-arm after a stop, for reconfiguration.
    pub fn restart(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = false;
        inner.lut.clear();
    }

    /// Byte offset of a batch slot within the input region.
    pub fn slot_offset(&self, index: u32) -> usize {
        index as usize * self.cfg.max_entries * self.cfg.max_input_size
    }

    /// Byte offset of one entry within the input region.
    pub fn entry_offset(&self, index: u32, entry: usize) -> usize {
        self.slot_offset(index) + entry * self.cfg.max_input_size
    }

    /// Total size of the batch region.
    pub fn region_size(&self) -> usize {
        self.cfg.max_batches * self.cfg.max_entries * self.cfg.max_input_size
    }

    /// Offset of the per-kind transition slots, past the batch region.
    pub fn transition_offset(&self, kind: u8) -> usize {
        self.region_size() + kind as usize * self.cfg.max_input_size
    }

    /// Size of the region including transition slots.
    pub fn region_size_with_transitions(&self) -> usize {
        self.region_size() + NUM_TRANSITIONS * self.cfg.max_input_size
    }

    pub fn alloc_count(&self) -> u64 {
        self.allocs.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock().lut.len()
    }

    pub fn waiting(&self) -> u64 {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Log slot accounting for diagnostics.
    pub fn dump(&self) {
        tracing::info!(
            in_use = self.in_use_count(),
            allocs = self.alloc_count(),
            frees = self.free_count(),
            waiting = self.waiting(),
            "batch manager state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> BatchManager {
        BatchManager::new(BatchManagerConfig {
            batch_duration: 8,
            max_batches: 4,
            max_entries: 8,
            max_input_size: 64,
            batching: true,
        })
    }

    #[test]
    fn test_fetch_same_window_returns_same_batch() {
        let bm = small();
        let a = bm.fetch_blocking(PulseId::new(16)).unwrap();
        let b = bm.fetch_blocking(PulseId::new(17)).unwrap();
        assert_eq!(a, b);
        assert_eq!(bm.in_use_count(), 1);
    }

    #[test]
    fn test_fetch_then_release_leaves_in_use_unchanged() {
        let bm = small();
        let before = bm.in_use_count();
        let batch = bm.fetch_blocking(PulseId::new(3)).unwrap();
        bm.release(batch.index());
        assert_eq!(bm.in_use_count(), before);
        assert_eq!(bm.alloc_count(), bm.free_count());
    }

    #[test]
    fn test_expired_by_duration_and_epoch() {
        let bm = small();
        let start = PulseId::new(6);
        assert!(!bm.expired(PulseId::new(7), start));
        // Crossing the epoch boundary expires even within the duration
        assert!(bm.expired(PulseId::new(8), start));
        assert!(bm.expired(PulseId::new(6 + 8), start));
    }

    #[test]
    fn test_stop_unblocks_fetch() {
        use std::sync::Arc;
        use std::thread;

        let bm = Arc::new(small());
        // Occupy slot 0 with epoch 0, then ask for epoch 4 (same slot).
        let batch = bm.fetch_blocking(PulseId::new(0)).unwrap();
        assert_eq!(batch.index(), 0);

        let bm2 = Arc::clone(&bm);
        let waiter = thread::spawn(move || bm2.fetch_blocking(PulseId::new(4 * 8)));
        while bm.waiting() == 0 {
            thread::yield_now();
        }
        bm.stop();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_store_records_app_prm() {
        let bm = small();
        let batch = bm.fetch_blocking(PulseId::new(10)).unwrap();
        bm.store(PulseId::new(10), 0xfeed);
        let rec = bm.release(batch.index()).unwrap();
        assert_eq!(rec.app_prms[2], 0xfeed); // 10 mod 8 == 2
    }

    #[test]
    fn test_region_geometry() {
        let bm = small();
        assert_eq!(bm.slot_offset(0), 0);
        assert_eq!(bm.slot_offset(1), 8 * 64);
        assert_eq!(bm.entry_offset(1, 2), 8 * 64 + 2 * 64);
        assert_eq!(bm.region_size(), 4 * 8 * 64);
        assert_eq!(bm.transition_offset(0), bm.region_size());
    }
}
