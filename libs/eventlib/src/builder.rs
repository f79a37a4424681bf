// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Event builder engine
//!
//! Two-level matching of contributions into events: a pending list of
//! epochs in key order, each holding its events in pulse-ID order. A
//! contribution locates its epoch by `pulse_id >> log2(duration)`, then its
//! event by exact pulse ID; the event's contract (the bitmask of expected
//! contributors, supplied by the injected trigger policy) determines
//! completeness.
//!
//! Completed events are dispatched strictly in pulse-ID order within an
//! epoch, and epochs retire strictly in key order, so downstream always
//! sees a monotonic stream. An event that cannot complete is eventually
//! fixed up: either because a later completion makes it due (look-ahead),
//! because a state transition settles the stream, or because the ageing
//! timer ran its counter down. Fixup marks the event with
//! `MissingContribution` damage and retires it as if complete.
//!
//! The ageing budget is a fixed number of expiry ticks regardless of
//! observed throughput; under bursty conditions an event may retire before
//! a slow contributor arrives, which surfaces as damage rather than loss.

use std::collections::VecDeque;

use crate::datagram::{Damage, Dgram};
use crate::error::{EbError, Result};
use crate::metrics as m;
use crate::pool::FixedPool;
use crate::pulse::{self, PulseId};

/// Trigger policy hooks, injected at construction.
///
/// These represent what the trigger decides, not what the engine is: which
/// contributors owe input for a given datagram, what stands in for a missing
/// contribution, and where completed events go.
pub trait TriggerPolicy: Send {
    /// Bitmask of contributors expected for the event opened by `dg`.
    fn contract(&self, dg: &Dgram) -> u64;

    /// Produce a sentinel contribution for a missing source, or `None` to
    /// record damage only.
    fn fixup(&mut self, event: &EbEvent, src: usize) -> Option<Dgram>;

    /// Dispatch a built event. Called in strict pulse-ID order.
    fn process(&mut self, event: &EbEvent);
}

/// Number of ageing ticks an event survives without new contributions.
pub const LIVING_INIT: i32 = 2;

/// Sizing for the event builder engine.
#[derive(Debug, Clone)]
pub struct EventBuilderConfig {
    /// Epoch pool depth.
    pub epochs: usize,
    /// Maximum events per epoch.
    pub entries: usize,
    /// Number of contributing sources.
    pub sources: usize,
    /// Epoch width in pulse ticks. Power of two.
    pub batch_duration: u64,
    /// Ageing budget in expiry ticks.
    pub living_init: i32,
    /// How many events ahead a completion must be to force fixup of older
    /// incomplete events.
    pub lookahead: usize,
}

impl Default for EventBuilderConfig {
    fn default() -> Self {
        Self {
            epochs: 32,
            entries: pulse::MAX_ENTRIES,
            sources: pulse::MAX_SOURCES,
            batch_duration: pulse::BATCH_DURATION,
            living_init: LIVING_INIT,
            lookahead: pulse::MAX_ENTRIES,
        }
    }
}

/// An event under construction: the unit of matching.
#[derive(Debug)]
pub struct EbEvent {
    pulse_id: PulseId,
    contract: u64,
    remaining: u64,
    living: i32,
    prm: u64,
    damage: Damage,
    size: usize,
    contributions: Vec<Dgram>,
}

impl EbEvent {
    fn empty() -> Self {
        Self {
            pulse_id: PulseId::default(),
            contract: 0,
            remaining: 0,
            living: 0,
            prm: 0,
            damage: Damage::NONE,
            size: 0,
            contributions: Vec::new(),
        }
    }

    fn reset(&mut self, pulse_id: PulseId, contract: u64, living: i32, prm: u64) {
        self.pulse_id = pulse_id;
        self.contract = contract;
        self.remaining = contract;
        self.living = living;
        self.prm = prm;
        self.damage = Damage::NONE;
        self.size = 0;
        self.contributions.clear();
        self.contributions
            .reserve(contract.count_ones() as usize);
    }

    pub fn sequence(&self) -> PulseId {
        self.pulse_id
    }

    /// Expected contributor bits.
    pub fn contract(&self) -> u64 {
        self.contract
    }

    /// Still-missing contributor bits; complete when zero.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn damage(&self) -> Damage {
        self.damage
    }

    /// Application free parameter, as stored through the batch manager.
    pub fn parameter(&self) -> u64 {
        self.prm
    }

    /// Total payload bytes across contributions.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Contributions in arrival order.
    pub fn contributions(&self) -> &[Dgram] {
        &self.contributions
    }

    /// The contribution that opened this event.
    pub fn creator(&self) -> &Dgram {
        &self.contributions[0]
    }

    pub fn alive(&self) -> bool {
        self.living > 0
    }

    fn insert(&mut self, dg: Dgram, living: i32) {
        self.remaining &= !(1 << dg.header.source());
        self.damage.increase(dg.header.damage());
        self.size += dg.payload.len();
        self.living = living;
        self.contributions.push(dg);
    }

    pub fn dump(&self) {
        tracing::debug!(
            pid = %self.pulse_id,
            contract = format_args!("{:016x}", self.contract),
            remaining = format_args!("{:016x}", self.remaining),
            damage = self.damage.value(),
            contributions = self.contributions.len(),
            living = self.living,
            "event state"
        );
    }
}

/// A time bucket of events pending completion.
#[derive(Debug)]
pub struct EbEpoch {
    key: u64,
    events: VecDeque<Box<EbEvent>>,
}

impl EbEpoch {
    fn empty() -> Self {
        Self {
            key: 0,
            events: VecDeque::new(),
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn events(&self) -> &VecDeque<Box<EbEvent>> {
        &self.events
    }
}

/// The two-level matching engine.
///
/// Owns the epoch and event pools and both pending lists; everything here
/// runs on the single builder thread, external references are by
/// `(epoch key, pulse id)`.
pub struct EventBuilder<P: TriggerPolicy> {
    cfg: EventBuilderConfig,
    policy: P,
    pending: VecDeque<Box<EbEpoch>>,
    epoch_pool: FixedPool<EbEpoch>,
    event_pool: FixedPool<EbEvent>,
    last_retired: Option<PulseId>,
    built_count: u64,
    fixup_count: u64,
    late_count: u64,
    source_error_count: u64,
    duplicate_count: u64,
}

impl<P: TriggerPolicy> EventBuilder<P> {
    pub fn new(cfg: EventBuilderConfig, policy: P) -> Self {
        assert!(cfg.batch_duration.is_power_of_two());
        assert!(cfg.sources <= pulse::MAX_SOURCES);
        let epoch_pool = FixedPool::new(cfg.epochs, EbEpoch::empty);
        let event_pool = FixedPool::new(cfg.epochs * cfg.entries, EbEvent::empty);
        Self {
            cfg,
            policy,
            pending: VecDeque::new(),
            epoch_pool,
            event_pool,
            last_retired: None,
            built_count: 0,
            fixup_count: 0,
            late_count: 0,
            source_error_count: 0,
            duplicate_count: 0,
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    /// Insert one contribution; dispatches whatever becomes due.
    pub fn process_contribution(&mut self, dg: Dgram, prm: u64) -> Result<()> {
        let pid = dg.pulse_id();
        let svc = dg.service()?;

        // Late arrival: downstream has already moved past this pulse.
        if let Some(last) = self.last_retired {
            if pid <= last {
                self.late_count += 1;
                metrics::counter!(m::EB_LATE_CONTRIBUTIONS).increment(1);
                tracing::warn!(pid = %pid, src = dg.header.source(), "late contribution dropped");
                return Ok(());
            }
        }

        let epoch_idx = self.match_epoch(pid)?;
        let event_idx = self.match_event(epoch_idx, &dg, prm)?;

        let src = dg.header.source();
        let event = &mut self.pending[epoch_idx].events[event_idx];

        if event.contract & (1 << src) == 0 {
            self.source_error_count += 1;
            metrics::counter!(m::EB_SOURCE_MISMATCHES).increment(1);
            tracing::warn!(
                pid = %pid,
                src,
                contract = format_args!("{:016x}", event.contract),
                "contribution source not in contract, dropped"
            );
            return Ok(());
        }
        if event.remaining & (1 << src) == 0 {
            self.duplicate_count += 1;
            tracing::warn!(pid = %pid, src, "duplicate contribution dropped");
            return Ok(());
        }

        let living = self.cfg.living_init;
        event.insert(dg, living);
        let completed = event.is_complete();

        // A state transition settles the stream: nothing older than it can
        // still gain contributors. A completed event makes strictly older
        // events due once it is far enough ahead.
        let due = if !svc.is_event() && svc != crate::datagram::TransitionKind::SlowUpdate {
            Some(Due::Before(pid))
        } else if completed {
            Some(Due::Through(pid))
        } else {
            None
        };
        self.flush(due);
        Ok(())
    }

    /// Ageing tick: run the oldest pending event's counter down, fixing it
    /// up when the counter expires. Any arrival resets the counter.
    pub fn expired(&mut self) {
        let expired = match self.pending.front_mut().and_then(|e| e.events.front_mut()) {
            Some(event) => {
                event.living -= 1;
                event.living <= 0
            }
            None => false,
        };
        if !expired {
            return;
        }
        let mut event = self.pending.front_mut().unwrap().events.pop_front().unwrap();
        tracing::debug!(pid = %event.sequence(), "event aged out");
        self.fixup_event(&mut event);
        self.dispatch(event);
        self.discard_empty_epochs();
        // The fixup may have unblocked in-order completions behind it.
        self.flush(None);
    }

    /// Number of events still pending across all epochs.
    pub fn pending_events(&self) -> usize {
        self.pending.iter().map(|e| e.events.len()).sum()
    }

    pub fn pending_epochs(&self) -> usize {
        self.pending.len()
    }

    pub fn built_count(&self) -> u64 {
        self.built_count
    }

    pub fn fixup_count(&self) -> u64 {
        self.fixup_count
    }

    pub fn late_count(&self) -> u64 {
        self.late_count
    }

    pub fn source_error_count(&self) -> u64 {
        self.source_error_count
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_count
    }

    pub fn epoch_alloc_count(&self) -> u64 {
        self.epoch_pool.num_allocs()
    }

    pub fn epoch_free_count(&self) -> u64 {
        self.epoch_pool.num_frees()
    }

    pub fn event_alloc_count(&self) -> u64 {
        self.event_pool.num_allocs()
    }

    pub fn event_free_count(&self) -> u64 {
        self.event_pool.num_frees()
    }

    /// Drop all pending state, fixing up nothing. Used at reconfigure.
    pub fn clear(&mut self) {
        while let Some(mut epoch) = self.pending.pop_front() {
            while let Some(event) = epoch.events.pop_front() {
                self.event_pool.free(event);
            }
            self.epoch_pool.free(epoch);
        }
        self.last_retired = None;
    }

    /// Log engine occupancy for diagnostics.
    pub fn dump(&self) {
        self.epoch_pool.dump("epochs");
        self.event_pool.dump("events");
        tracing::info!(
            pending_epochs = self.pending.len(),
            pending_events = self.pending_events(),
            built = self.built_count,
            fixups = self.fixup_count,
            late = self.late_count,
            source_errors = self.source_error_count,
            "event builder state"
        );
    }

    /// Locate or create the epoch for `pid`, keeping key order.
    fn match_epoch(&mut self, pid: PulseId) -> Result<usize> {
        let key = pid.epoch(self.cfg.batch_duration);
        // Contributions from a single source arrive in pulse order, so the
        // target is at or near the tail.
        let mut pos = self.pending.len();
        for (i, epoch) in self.pending.iter().enumerate().rev() {
            if epoch.key == key {
                return Ok(i);
            }
            if epoch.key < key {
                pos = i + 1;
                break;
            }
            pos = i;
        }
        let mut epoch = self
            .epoch_pool
            .alloc()
            .ok_or_else(|| EbError::Capacity("epoch pool exhausted".into()))?;
        epoch.key = key;
        epoch.events.clear();
        self.pending.insert(pos, epoch);
        Ok(pos)
    }

    /// Locate or create the event for `dg` within the epoch at `epoch_idx`.
    fn match_event(&mut self, epoch_idx: usize, dg: &Dgram, prm: u64) -> Result<usize> {
        let pid = dg.pulse_id();
        let epoch = &self.pending[epoch_idx];
        let mut pos = epoch.events.len();
        for (i, event) in epoch.events.iter().enumerate().rev() {
            if event.pulse_id == pid {
                return Ok(i);
            }
            if event.pulse_id < pid {
                pos = i + 1;
                break;
            }
            pos = i;
        }
        let contract = self.policy.contract(dg);
        if contract == 0 {
            return Err(EbError::Protocol(format!(
                "empty contract for pulse {pid}"
            )));
        }
        let mut event = self
            .event_pool
            .alloc()
            .ok_or_else(|| EbError::Capacity("event pool exhausted".into()))?;
        event.reset(pid, contract, self.cfg.living_init, prm);
        self.pending[epoch_idx].events.insert(pos, event);
        Ok(pos)
    }

    /// Dispatch due events in order from the front of the pending list.
    ///
    /// Without a `due` bound only complete events are dispatched, stopping
    /// at the first incomplete one. With a bound, incomplete events inside
    /// it are fixed up, gated by look-ahead for completion-driven bounds.
    fn flush(&mut self, due: Option<Due>) {
        loop {
            self.discard_empty_epochs();
            let Some(front) = self.pending.front().and_then(|e| e.events.front()) else {
                break;
            };
            let front_pid = front.pulse_id;

            if front.is_complete() {
                let event = self.pending.front_mut().unwrap().events.pop_front().unwrap();
                self.dispatch(event);
                continue;
            }

            let fixable = match due {
                Some(Due::Before(pid)) => front_pid < pid,
                Some(Due::Through(pid)) => {
                    front_pid <= pid
                        && self.events_ahead(front_pid, pid) >= self.cfg.lookahead
                }
                None => false,
            };
            if !fixable {
                break;
            }
            let mut event = self.pending.front_mut().unwrap().events.pop_front().unwrap();
            self.fixup_event(&mut event);
            self.dispatch(event);
        }
        self.discard_empty_epochs();
    }

    /// Number of pending events between `from` (exclusive) and `to`
    /// (inclusive), the look-ahead distance.
    fn events_ahead(&self, from: PulseId, to: PulseId) -> usize {
        self.pending
            .iter()
            .flat_map(|e| e.events.iter())
            .filter(|ev| ev.pulse_id > from && ev.pulse_id <= to)
            .count()
    }

    /// Complete an event that did not meet its contract.
    fn fixup_event(&mut self, event: &mut EbEvent) {
        let mut missing = event.remaining;
        while missing != 0 {
            let src = missing.trailing_zeros() as usize;
            missing &= missing - 1;
            if let Some(sentinel) = self.policy.fixup(event, src) {
                event.size += sentinel.payload.len();
                event.contributions.push(sentinel);
            }
            event.remaining &= !(1 << src);
        }
        event.damage.increase(Damage::MISSING_CONTRIBUTION);
        self.fixup_count += 1;
        metrics::counter!(m::EB_EVENTS_FIXED_UP).increment(1);
    }

    fn dispatch(&mut self, event: Box<EbEvent>) {
        debug_assert!(event.is_complete());
        self.policy.process(&event);
        self.built_count += 1;
        metrics::counter!(m::EB_EVENTS_BUILT).increment(1);
        self.last_retired = Some(match self.last_retired {
            Some(last) => last.max(event.pulse_id),
            None => event.pulse_id,
        });
        self.event_pool.free(event);
    }

    /// Retire leading epochs that have no events left. An epoch is only
    /// discarded from the front, so lower keys always retire first.
    fn discard_empty_epochs(&mut self) {
        while let Some(front) = self.pending.front() {
            if !front.events.is_empty() {
                break;
            }
            let epoch = self.pending.pop_front().unwrap();
            self.epoch_pool.free(epoch);
        }
    }
}

/// Flush bound: how far fixup may reach.
#[derive(Debug, Clone, Copy)]
enum Due {
    /// Fix up events strictly before this pulse (stream settled by a
    /// transition).
    Before(PulseId),
    /// Fix up events through this pulse, gated by look-ahead distance.
    Through(PulseId),
}
