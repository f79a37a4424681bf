// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pulse-ID time domain
//!
//! Every contribution carries a pulse ID: a 56-bit monotonic counter derived
//! from the 1 us master clock. The low `log2(BATCH_DURATION)` bits designate
//! the position within an epoch; the higher bits identify the epoch itself.
//! Epochs are the unit of batching on the contributor side and the unit of
//! retirement in the event builder.

use serde::{Deserialize, Serialize};

/// Maximum number of datagrams in one batch.
pub const MAX_ENTRIES: usize = 64;

/// Width of one epoch in beam pulse ticks (1 us). Power of 2, >= MAX_ENTRIES.
pub const BATCH_DURATION: u64 = MAX_ENTRIES as u64;

/// Maximum tolerated latency, in beam pulse ticks.
pub const MAX_LATENCY: u64 = 4 * 1024 * 1024;

/// Maximum number of batches in circulation.
pub const MAX_BATCHES: usize = (MAX_LATENCY / BATCH_DURATION) as usize;

/// Number of readout groups supported.
pub const NUM_READOUT_GROUPS: usize = 16;

/// Maximum possible number of contributors (sources fit a 64-bit mask).
pub const MAX_SOURCES: usize = 64;

/// Width of the pulse counter in bits.
pub const PULSE_ID_BITS: u32 = 56;

const PULSE_ID_MASK: u64 = (1 << PULSE_ID_BITS) - 1;

// Sanity checks
const _: () = assert!(BATCH_DURATION.is_power_of_two());
const _: () = assert!(MAX_BATCHES.is_power_of_two());
const _: () = assert!(MAX_ENTRIES as u64 <= BATCH_DURATION);

/// 56-bit monotonic timestamp in 1 us ticks identifying a physics event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PulseId(u64);

impl PulseId {
    pub fn new(raw: u64) -> Self {
        Self(raw & PULSE_ID_MASK)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// The epoch bucket this pulse belongs to: `pulse_id >> log2(duration)`.
    ///
    /// `duration` must be a power of two.
    pub fn epoch(self, duration: u64) -> u64 {
        debug_assert!(duration.is_power_of_two());
        self.0 >> duration.trailing_zeros()
    }

    /// Position of this pulse within its epoch.
    pub fn entry(self, duration: u64) -> u64 {
        debug_assert!(duration.is_power_of_two());
        self.0 & (duration - 1)
    }

    /// Batch slot for this pulse: `(pulse_id / duration) mod max_batches`.
    ///
    /// Both producer and consumer compute the same slot without negotiation;
    /// the slot count bounds the number of batches in circulation.
    pub fn batch_index(self, duration: u64, max_batches: usize) -> u32 {
        debug_assert!(max_batches.is_power_of_two());
        (self.epoch(duration) & (max_batches as u64 - 1)) as u32
    }

    /// True if `self` and `other` fall in different epochs.
    pub fn crosses_epoch(self, other: PulseId, duration: u64) -> bool {
        self.epoch(duration) != other.epoch(duration)
    }
}

impl std::fmt::Display for PulseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:014x}", self.0)
    }
}

impl From<u64> for PulseId {
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}
