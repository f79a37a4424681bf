// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Monitor fan-out server
//!
//! Built events reach monitoring consumers through a single-writer,
//! multi-reader shared-memory ring (see [`crate::shmem`]). Buffer slots
//! circulate on credits: a slot index is popped from the free list when a
//! buffer request is posted to a trigger event builder, travels inside the
//! environment word of the built event that comes back, and returns to the
//! free list when the last consumer releases it. No credit means no
//! request; the event builder simply stops being offered events, nothing is
//! dropped here.
//!
//! Transitions bypass the credit loop entirely: each transition kind has a
//! dedicated slot past the event buffers and is broadcast to every
//! consumer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::builder::{EbEvent, TriggerPolicy};
use crate::datagram::{
    buffer_index_from_env, env_with_buffer_index, Dgram, DgramHeader, TransitionKind,
    DGRAM_HEADER_SIZE,
};
use crate::error::{EbError, Result};
use crate::immdata::{ImmData, ImmResponse};
use crate::link::FabricLink;
use crate::metrics as m;
use crate::pulse::NUM_READOUT_GROUPS;
use crate::queue::CreditQueue;
use crate::shmem::{TransferLayout, TransferRegion};

/// Largest buffer count the environment-word encoding can carry.
pub const MAX_EV_BUFFERS: usize = 255;

/// What happened to a published datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Taken synchronously; the caller may reuse the datagram at once.
    Handled,
    /// A buffer slot now holds the event until consumers release it.
    Deferred,
}

/// Monitor server sizing and identity.
#[derive(Debug, Clone)]
pub struct MonitorServerConfig {
    /// This process's id, encoded into request immediate words.
    pub id: usize,
    /// Shared-memory segment name, e.g. `/daq-<partition>-<tag>`.
    pub tag: String,
    /// Event buffer slots. 1..=255; the encoding reserves 8 env bits.
    pub num_ev_buffers: usize,
    /// Slot size; must hold the largest built event or transition.
    pub max_buffer_size: usize,
    /// Consumer queues to fan out across.
    pub num_ev_queues: usize,
    /// One consumer per event (round-robin) instead of every consumer
    /// seeing every event.
    pub distribute: bool,
}

/// The fan-out server. Single writer; runs on the builder thread.
pub struct MonitorServer {
    cfg: MonitorServerConfig,
    region: TransferRegion,
    mrq_links: Vec<Arc<dyn FabricLink>>,
    next_teb: usize,
    next_queue: usize,
    free_list: CreditQueue,
    /// Per-slot free/checked-out state, for double-free rejection.
    free_flags: Box<[AtomicBool]>,
    /// Outstanding consumer references per slot in broadcast mode.
    refcounts: Box<[AtomicU32]>,
    event_count: u64,
    transition_count: u64,
    request_count: u64,
    request_skip_count: u64,
    double_free_count: u64,
}

impl MonitorServer {
    pub fn new(cfg: MonitorServerConfig) -> Result<Self> {
        if cfg.num_ev_buffers == 0 || cfg.num_ev_buffers > MAX_EV_BUFFERS {
            return Err(EbError::Configuration(format!(
                "number of event buffers {} is outside 1..={MAX_EV_BUFFERS}",
                cfg.num_ev_buffers
            )));
        }
        if cfg.num_ev_queues == 0 {
            return Err(EbError::Configuration("no event queues".into()));
        }
        if cfg.max_buffer_size < DGRAM_HEADER_SIZE {
            return Err(EbError::Configuration(format!(
                "buffer size {} cannot hold a datagram header",
                cfg.max_buffer_size
            )));
        }
        let layout = TransferLayout {
            num_buffers: cfg.num_ev_buffers,
            num_queues: cfg.num_ev_queues,
            buffer_size: cfg.max_buffer_size,
        };
        let region = TransferRegion::create(&cfg.tag, layout, cfg.distribute)?;
        let free_list = CreditQueue::new(cfg.num_ev_buffers);
        let free_flags = (0..cfg.num_ev_buffers)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let refcounts = (0..cfg.num_ev_buffers)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            cfg,
            region,
            mrq_links: Vec::new(),
            next_teb: 0,
            next_queue: 0,
            free_list,
            free_flags,
            refcounts,
            event_count: 0,
            transition_count: 0,
            request_count: 0,
            request_skip_count: 0,
            double_free_count: 0,
        })
    }

    /// Install the trigger-EB request links and fill the free list.
    pub fn configure(&mut self, mrq_links: Vec<Arc<dyn FabricLink>>) -> Result<()> {
        self.mrq_links = mrq_links;
        self.next_teb = 0;
        self.next_queue = 0;
        self.free_list.clear();
        for idx in 0..self.cfg.num_ev_buffers as u32 {
            self.free_list.push(idx)?;
            self.free_flags[idx as usize].store(true, Ordering::Relaxed);
            self.refcounts[idx as usize].store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn config(&self) -> &MonitorServerConfig {
        &self.cfg
    }

    pub fn region(&self) -> &TransferRegion {
        &self.region
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn request_skip_count(&self) -> u64 {
        self.request_skip_count
    }

    pub fn double_free_count(&self) -> u64 {
        self.double_free_count
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Publish a built event into the slot its request reserved.
    ///
    /// The slot index rides in the event's application parameter (the
    /// request's immediate word). Also issues the next buffer request, if a
    /// credit is available.
    pub fn publish_event(&mut self, event: &EbEvent) -> Result<Disposition> {
        self.request_datagram();

        let imm = ImmData::decode(event.parameter() as u32)?;
        let index = imm.index() as usize;
        if index >= self.cfg.num_ev_buffers {
            return Err(EbError::Protocol(format!(
                "event buffer index {index} out of range"
            )));
        }

        self.copy_event(event, index)?;

        // Fan out: one consumer round-robin, or all of them.
        if self.cfg.distribute {
            let queue = self.next_queue;
            self.next_queue = (self.next_queue + 1) % self.cfg.num_ev_queues;
            self.refcounts[index].store(1, Ordering::Relaxed);
            self.region.consumer_ring(queue).push(index as u32);
        } else {
            self.refcounts[index]
                .store(self.cfg.num_ev_queues as u32, Ordering::Relaxed);
            for queue in 0..self.cfg.num_ev_queues {
                self.region.consumer_ring(queue).push(index as u32);
            }
        }

        self.event_count += 1;
        metrics::counter!(m::MON_EVENTS_PUBLISHED).increment(1);
        Ok(Disposition::Deferred)
    }

    /// Broadcast a transition to every consumer, outside the credit loop.
    pub fn publish_transition(&mut self, dg: &Dgram) -> Result<Disposition> {
        let kind = dg.service()?;
        if kind.is_event() {
            return Err(EbError::Protocol(format!(
                "pulse {} is not a transition",
                dg.pulse_id()
            )));
        }
        let size = dg.size();
        if size > self.cfg.max_buffer_size {
            return Err(EbError::Protocol(format!(
                "{} transition of size {size} too big for buffer of size {}",
                kind.name(),
                self.cfg.max_buffer_size
            )));
        }
        let slot = self.region.transition_slot(kind as u8);
        let buf = self.region.buffer_mut(slot);
        buf[..DGRAM_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&dg.header));
        buf[DGRAM_HEADER_SIZE..size].copy_from_slice(&dg.payload);

        for queue in 0..self.cfg.num_ev_queues {
            self.region.consumer_ring(queue).push(slot as u32);
        }
        self.transition_count += 1;
        Ok(Disposition::Handled)
    }

    /// Drain the release ring, returning freed slots to the credit pool.
    pub fn poll_releases(&mut self) {
        while let Some(env) = self.region.release_ring().pop() {
            self.delete_datagram(env);
        }
    }

    /// Issue one buffer request to the trigger event builders.
    ///
    /// Skipped (with a count) when no buffer credit is available.
    fn request_datagram(&mut self) {
        let Some(index) = self.free_list.pop() else {
            self.request_skip_count += 1;
            metrics::counter!(m::MON_REQUESTS_SKIPPED).increment(1);
            tracing::debug!("no free buffers, request skipped");
            return;
        };
        self.free_flags[index as usize].store(false, Ordering::Relaxed);

        let imm = ImmData::buffer(ImmResponse::Unspecified, self.cfg.id, index);
        let mut rc = -1;
        for _ in 0..self.mrq_links.len() {
            let teb = self.next_teb;
            self.next_teb = (self.next_teb + 1) % self.mrq_links.len();
            rc = self.mrq_links[teb].post(&[], 0, imm);
            if rc == 0 {
                break;
            }
        }
        if rc != 0 {
            tracing::error!(rc, index, "unable to post buffer request to any TEB");
            self.free_flags[index as usize].store(true, Ordering::Relaxed);
            let _ = self.free_list.push(index);
            return;
        }
        self.request_count += 1;
        metrics::counter!(m::MON_REQUESTS_POSTED).increment(1);
    }

    /// Reconstruct the outer datagram for `event` in slot `index`.
    ///
    /// The outer payload is each contribution's tree, concatenated in
    /// arrival order; the outer damage accumulates all contribution damage.
    fn copy_event(&mut self, event: &EbEvent, index: usize) -> Result<()> {
        let payload_size: usize = event.contributions().iter().map(Dgram::size).sum();
        let total = DGRAM_HEADER_SIZE + payload_size;
        if total > self.cfg.max_buffer_size {
            return Err(EbError::Protocol(format!(
                "built event of size {total} too big for buffer of size {}",
                self.cfg.max_buffer_size
            )));
        }

        let mut header: DgramHeader = event.creator().header;
        header.damage = event.damage().value();
        header.extent = payload_size as u32;
        header.env = env_with_buffer_index(header.env, index as u32);

        let buf = self.region.buffer_mut(index);
        buf[..DGRAM_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        let mut at = DGRAM_HEADER_SIZE;
        for ctrb in event.contributions() {
            buf[at..at + DGRAM_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&ctrb.header));
            at += DGRAM_HEADER_SIZE;
            buf[at..at + ctrb.payload.len()].copy_from_slice(&ctrb.payload);
            at += ctrb.payload.len();
        }
        Ok(())
    }

    /// Return a slot to the free list, recovering its index from the
    /// released datagram's environment word.
    fn delete_datagram(&mut self, env: u32) {
        let index = buffer_index_from_env(env) as usize;
        if index >= self.cfg.num_ev_buffers {
            tracing::warn!(index, "release with unexpected buffer index");
            return;
        }
        let refs = &self.refcounts[index];
        let prior = refs.load(Ordering::Relaxed);
        if prior > 1 {
            refs.store(prior - 1, Ordering::Relaxed);
            return;
        }
        refs.store(0, Ordering::Relaxed);

        if self.free_flags[index].swap(true, Ordering::Relaxed) {
            self.double_free_count += 1;
            metrics::counter!(m::MON_DOUBLE_FREES).increment(1);
            tracing::error!(index, "attempted double free of buffer, ignored");
            return;
        }
        if self.free_list.push(index as u32).is_err() {
            tracing::error!(index, "free list overflow on release");
        }
    }

    /// Reset per-run counters, leaving links and buffers alone.
    pub fn reset_counts(&mut self) {
        self.event_count = 0;
        self.transition_count = 0;
        self.request_count = 0;
        self.request_skip_count = 0;
        self.double_free_count = 0;
    }

    /// Tear down fan-out state; the shared segment unmaps on drop.
    pub fn shutdown(&mut self) {
        self.mrq_links.clear();
        self.free_list.clear();
        tracing::info!(
            events = self.event_count,
            transitions = self.transition_count,
            requests = self.request_count,
            skips = self.request_skip_count,
            "monitor server stopped"
        );
    }
}

/// Consumer-side attachment to a monitor server's transfer segment.
pub struct MonitorConsumer {
    region: TransferRegion,
    queue: usize,
}

impl MonitorConsumer {
    pub fn attach(tag: &str, layout: TransferLayout, queue: usize) -> Result<Self> {
        if queue >= layout.num_queues {
            return Err(EbError::Configuration(format!(
                "consumer queue {queue} out of range"
            )));
        }
        let region = TransferRegion::open(tag, layout)?;
        Ok(Self { region, queue })
    }

    /// Next datagram for this consumer, decoded out of shared memory.
    pub fn next(&self) -> Option<(u32, Dgram)> {
        let slot = self.region.consumer_ring(self.queue).pop()?;
        let buf = self.region.buffer(slot as usize);
        match Dgram::decode(buf) {
            Ok((dg, _)) => Some((slot, dg)),
            Err(err) => {
                tracing::error!(slot, %err, "undecodable datagram in transfer buffer");
                None
            }
        }
    }

    /// Release an event buffer back to the server.
    ///
    /// `env` is the environment word of the released datagram; the server
    /// recovers the slot index from it. Transition slots are not released.
    pub fn release(&self, env: u32) {
        self.region.release_ring().push(env);
    }
}

/// Trigger policy for the monitor event builder: contracts come from the
/// readout-group map, missing contributions are damage-only, and completed
/// events go to the fan-out server.
pub struct MebPolicy {
    contractors: [u64; NUM_READOUT_GROUPS],
    server: MonitorServer,
    fatal: Option<EbError>,
}

impl MebPolicy {
    pub fn new(contractors: [u64; NUM_READOUT_GROUPS], server: MonitorServer) -> Self {
        Self {
            contractors,
            server,
            fatal: None,
        }
    }

    pub fn server(&self) -> &MonitorServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut MonitorServer {
        &mut self.server
    }

    /// A protocol error raised inside `process`, if any. Checked by the
    /// run loop; such an error is fatal to the process.
    pub fn take_fatal(&mut self) -> Option<EbError> {
        self.fatal.take()
    }
}

impl TriggerPolicy for MebPolicy {
    fn contract(&self, dg: &Dgram) -> u64 {
        let mut contract = 0;
        let mut groups = dg.header.readout_groups;
        while groups != 0 {
            let group = groups.trailing_zeros() as usize;
            groups &= groups - 1;
            if group < NUM_READOUT_GROUPS {
                contract |= self.contractors[group];
            }
        }
        contract
    }

    fn fixup(&mut self, _event: &EbEvent, _src: usize) -> Option<Dgram> {
        // Monitoring tolerates holes; damage alone marks the gap.
        None
    }

    fn process(&mut self, event: &EbEvent) {
        let result = if event.creator().is_event() {
            self.server.publish_event(event).map(|_| ())
        } else {
            let transition = event.creator().clone();
            self.server.publish_transition(&transition).map(|_| ())
        };
        if let Err(err) = result {
            match err {
                EbError::Protocol(_) => {
                    tracing::error!(%err, "fatal protocol error publishing event");
                    self.fatal = Some(err);
                }
                other => {
                    tracing::warn!(%other, "event publication degraded");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::TransitionKind;
    use crate::link::LoopbackFabric;
    use crate::pulse::PulseId;
    use std::time::Duration;

    fn server(buffers: usize, queues: usize, distribute: bool, tag: &str) -> MonitorServer {
        MonitorServer::new(MonitorServerConfig {
            id: 0,
            tag: format!("/eventlib-mon-{}-{}", tag, std::process::id()),
            num_ev_buffers: buffers,
            max_buffer_size: 1024,
            num_ev_queues: queues,
            distribute,
        })
        .unwrap()
    }

    #[test]
    fn test_buffer_count_limits() {
        for n in [8, 255] {
            let cfg = MonitorServerConfig {
                id: 0,
                tag: format!("/eventlib-mon-lim{}-{}", n, std::process::id()),
                num_ev_buffers: n,
                max_buffer_size: 512,
                num_ev_queues: 1,
                distribute: false,
            };
            assert!(MonitorServer::new(cfg).is_ok(), "{n} buffers must boot");
        }
        let cfg = MonitorServerConfig {
            id: 0,
            tag: format!("/eventlib-mon-lim256-{}", std::process::id()),
            num_ev_buffers: 256,
            max_buffer_size: 512,
            num_ev_queues: 1,
            distribute: false,
        };
        assert!(MonitorServer::new(cfg).is_err(), "256 buffers must be rejected");
    }

    #[test]
    fn test_requests_consume_credits_then_skip() {
        let fabric = LoopbackFabric::new();
        let teb = fabric.serve("teb-mrq", 0, 0);
        let mut srv = server(4, 1, false, "credits");
        let link = fabric.connect("teb-mrq", Duration::from_secs(1)).unwrap();
        srv.configure(vec![link]).unwrap();

        for _ in 0..10 {
            srv.request_datagram();
        }
        assert_eq!(srv.request_count(), 4);
        assert_eq!(srv.request_skip_count(), 6);
        // The four requests went out with distinct indices.
        let mut indices = Vec::new();
        while let Some(d) = teb.poll() {
            indices.push(ImmData::decode(d.imm).unwrap().index());
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut srv = server(4, 1, false, "dblfree");
        srv.configure(Vec::new()).unwrap();
        assert_eq!(srv.free_count(), 4);

        // A release for a slot that is already free must not grow the list.
        srv.delete_datagram(env_with_buffer_index(0, 2));
        assert_eq!(srv.double_free_count(), 1);
        assert_eq!(srv.free_count(), 4);
    }

    #[test]
    fn test_transition_broadcast_bypasses_credits() {
        let mut srv = server(2, 3, true, "trbcast");
        srv.configure(Vec::new()).unwrap();
        let dg = Dgram::transition(PulseId::new(50), TransitionKind::Disable, 0, 1);
        assert_eq!(srv.publish_transition(&dg).unwrap(), Disposition::Handled);
        assert_eq!(srv.free_count(), 2, "credits untouched");
        for queue in 0..3 {
            assert_eq!(
                srv.region().consumer_ring(queue).len(),
                1,
                "every consumer sees the transition"
            );
        }
    }
}
