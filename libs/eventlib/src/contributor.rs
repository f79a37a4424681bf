// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Contribution poster
//!
//! Groups outgoing contributions into batches and posts each batch to the
//! event-builder peer that owns its pulse window. Peer selection is a pure
//! function of the batch index, so every contributor independently agrees
//! on which peer builds a given pulse; only that peer emits a result the
//! contributor can match by immediate-data tag.
//!
//! A batch is extended while its window lasts and the stream stays on
//! L1Accept/SlowUpdate; it is posted when the window expires or a state
//! transition forces a flush. Contributions whose readout groups do not
//! intersect the common group bypass the builder entirely: they are
//! end-of-list tagged and parked on the in-flight queue for local result
//! matching.
//!
//! Posting the last datagram's end-of-list marker happens before the batch
//! is pushed onto the in-flight queue, so the result matcher never sees a
//! batch that is still being assembled.

use std::sync::Arc;

use crate::batch::{Batch, BatchManager};
use crate::datagram::Dgram;
use crate::error::{EbError, Result};
use crate::immdata::{ImmData, ImmResponse};
use crate::link::FabricLink;
use crate::metrics as m;
use crate::queue::InFlightQueue;

/// Identity and policy for a contributor.
#[derive(Debug, Clone)]
pub struct ContributorConfig {
    /// This contributor's instance id; stamped into every immediate word.
    pub id: usize,
    /// Readout-group bit of the common (trigger) group.
    pub common_group: u16,
    /// Readout groups for which this process supplies trigger input.
    pub contractor: u16,
}

/// Work the result matcher will have to account for.
#[derive(Debug)]
pub enum InFlight {
    /// A posted batch, identified by its slot.
    Batch { index: u32, entries: usize },
    /// A contribution that bypassed the event builder.
    Bypass { dgram: Dgram },
}

struct OpenBatch {
    batch: Batch,
    entries: Vec<Dgram>,
}

/// The contribution-side pipeline stage.
pub struct Contributor {
    cfg: ContributorConfig,
    batman: Arc<BatchManager>,
    links: Vec<Arc<dyn FabricLink>>,
    in_flight: Arc<InFlightQueue<InFlight>>,
    open: Option<OpenBatch>,
    /// Contractor bits accumulated over the current batch.
    contractor: u16,
    event_count: u64,
    batch_count: u64,
}

impl Contributor {
    pub fn new(
        cfg: ContributorConfig,
        batman: Arc<BatchManager>,
        links: Vec<Arc<dyn FabricLink>>,
        in_flight: Arc<InFlightQueue<InFlight>>,
    ) -> Self {
        Self {
            cfg,
            batman,
            links,
            in_flight,
            open: None,
            contractor: 0,
            event_count: 0,
            batch_count: 0,
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn batch_count(&self) -> u64 {
        self.batch_count
    }

    pub fn in_flight(&self) -> &InFlightQueue<InFlight> {
        &self.in_flight
    }

    /// The peer that builds events for batch slot `index`.
    pub fn peer_for(&self, index: u32) -> usize {
        index as usize % self.links.len()
    }

    /// Feed one contribution through the batching state machine.
    ///
    /// `app_prm` is an opaque per-event parameter recovered at result
    /// matching time. Returns quietly once the batch manager has been
    /// stopped.
    pub fn process(&mut self, mut dg: Dgram, app_prm: u64) -> Result<()> {
        let max_input = self.batman.config().max_input_size;
        if dg.size() > max_input {
            return Err(EbError::Protocol(format!(
                "contribution of size {} exceeds max input size {max_input}",
                dg.size()
            )));
        }
        if dg.header.source() != self.cfg.id {
            return Err(EbError::Protocol(format!(
                "contribution src {} does not match contributor id {}",
                dg.header.source(),
                self.cfg.id
            )));
        }
        let svc = dg.service()?;
        let pid = dg.pulse_id();
        let groups = dg.header.readout_groups;
        self.event_count += 1;
        metrics::counter!(m::CTRB_EVENTS).increment(1);

        if groups & self.cfg.common_group != 0 {
            // Common group triggered: the builder path.
            if self.open.is_none() {
                let Some(batch) = self.batman.fetch_blocking(pid) else {
                    return Ok(()); // Stopped
                };
                self.contractor = groups & self.cfg.contractor;
                self.open = Some(OpenBatch {
                    batch,
                    entries: Vec::new(),
                });
            }

            let start = self.open.as_ref().unwrap().batch.start();
            let expired = self.batman.expired(pid, start);
            let flush = !(svc == crate::datagram::TransitionKind::L1Accept
                || svc == crate::datagram::TransitionKind::SlowUpdate)
                || !self.batman.config().batching;

            if !(expired || flush) {
                self.batman.store(pid, app_prm);
                self.contractor |= groups & self.cfg.contractor;
                self.open.as_mut().unwrap().entries.push(dg.clone());
            } else {
                if expired {
                    // Post the batch the window closed on, then open a new
                    // one with the datagram that expired it.
                    if self.contractor != 0 {
                        self.post_open()?;
                    } else {
                        self.release_open();
                    }
                    let Some(batch) = self.batman.fetch_blocking(pid) else {
                        return Ok(());
                    };
                    self.contractor = groups & self.cfg.contractor;
                    self.open = Some(OpenBatch {
                        batch,
                        entries: Vec::new(),
                    });
                }

                self.batman.store(pid, app_prm);
                self.open.as_mut().unwrap().entries.push(dg.clone());
                self.contractor |= groups & self.cfg.contractor;

                if flush {
                    if self.contractor != 0 {
                        self.post_open()?;
                    } else {
                        self.release_open();
                    }
                }
            }
        } else {
            // Common group did not trigger: bypass the event builder.
            if self.open.is_some() {
                if self.contractor != 0 {
                    self.post_open()?;
                } else {
                    self.release_open();
                }
            }
            dg.header.set_eol();
            self.in_flight.push(InFlight::Bypass { dgram: dg.clone() })?;
        }

        // Keep non-selected peers synchronized by forwarding transitions.
        // In particular a Disable flushes out whatever results batch they
        // have in progress.
        if !svc.is_event() && self.contractor != 0 {
            self.forward_transition(&dg)?;
        }
        Ok(())
    }

    /// Post the open batch to its selected peer.
    fn post_open(&mut self) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        if open.entries.is_empty() {
            self.batman.release(open.batch.index());
            return Ok(());
        }
        open.entries.last_mut().unwrap().header.set_eol();

        let index = open.batch.index();
        let max_input = self.batman.config().max_input_size;
        let mut wire = vec![0u8; open.entries.len() * max_input];
        for (i, entry) in open.entries.iter().enumerate() {
            let mut at = Vec::with_capacity(entry.size());
            entry.encode_into(&mut at);
            wire[i * max_input..i * max_input + at.len()].copy_from_slice(&at);
        }

        let offset = self.batman.slot_offset(index);
        let imm = ImmData::buffer(ImmResponse::Response, self.cfg.id, index);
        let dst = self.peer_for(index);

        // On the queue before any corresponding result can show up.
        self.in_flight.push(InFlight::Batch {
            index,
            entries: open.entries.len(),
        })?;

        let rc = self.links[dst].post(&wire, offset, imm);
        if rc < 0 {
            tracing::warn!(rc, index, dst, "batch post failed");
            return Ok(());
        }
        self.batch_count += 1;
        metrics::counter!(m::CTRB_BATCHES).increment(1);
        tracing::trace!(
            index,
            dst,
            entries = wire.len() / max_input,
            offset,
            "batch posted"
        );
        Ok(())
    }

    /// Return an unposted batch slot to the manager.
    fn release_open(&mut self) {
        if let Some(open) = self.open.take() {
            self.batman.release(open.batch.index());
        }
    }

    /// Send a copy of a transition to every peer except the one that got
    /// the batch containing it. Those peers will not generate responses.
    fn forward_transition(&self, dg: &Dgram) -> Result<()> {
        if self.links.len() < 2 {
            return Ok(());
        }
        if !dg.payload.is_empty() {
            return Err(EbError::Protocol(format!(
                "{} transition carries an unexpected payload",
                dg.service()?.name()
            )));
        }
        let cfg = self.batman.config();
        let index = dg.pulse_id().batch_index(cfg.batch_duration, cfg.max_batches);
        let dst = self.peer_for(index);
        let kind = dg.service()? as u8;
        let offset = self.batman.transition_offset(kind);
        let imm = ImmData::transition(ImmResponse::NoResponse, self.cfg.id, kind as u32);

        let mut wire = Vec::with_capacity(dg.size());
        let mut copy = dg.clone();
        copy.header.set_eol();
        copy.encode_into(&mut wire);

        for link in &self.links {
            if link.id() == dst {
                continue; // The batch posted to dst includes this datagram
            }
            let rc = link.post(&wire, offset, imm);
            if rc < 0 {
                tracing::warn!(rc, peer = link.id(), "transition forward failed");
            }
        }
        Ok(())
    }

    /// Post whatever is open and stop accepting input.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.contractor != 0 {
            self.post_open()?;
        } else {
            self.release_open();
        }
        self.batman.stop();
        self.batman.dump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchManagerConfig;
    use crate::datagram::{DgramHeader, TransitionKind};
    use crate::immdata::ImmKind;
    use crate::link::{LoopbackFabric, LoopbackServer};
    use crate::pulse::PulseId;
    use std::time::Duration;

    const MAX_INPUT: usize = 128;

    fn harness(num_peers: usize) -> (Contributor, Vec<LoopbackServer>) {
        let fabric = LoopbackFabric::new();
        let batman = Arc::new(BatchManager::new(BatchManagerConfig {
            batch_duration: 8,
            max_batches: 16,
            max_entries: 8,
            max_input_size: MAX_INPUT,
            batching: true,
        }));
        let region = batman.region_size_with_transitions();
        let mut servers = Vec::new();
        let mut links = Vec::new();
        for peer in 0..num_peers {
            let name = format!("teb{peer}");
            servers.push(fabric.serve(&name, peer, region));
            let link: Arc<dyn FabricLink> =
                fabric.connect(&name, Duration::from_secs(1)).unwrap();
            links.push(link);
        }
        let in_flight = Arc::new(InFlightQueue::new(64));
        let ctrb = Contributor::new(
            ContributorConfig {
                id: 1,
                common_group: 0x1,
                contractor: 0x1,
            },
            batman,
            links,
            in_flight,
        );
        (ctrb, servers)
    }

    fn l1(pid: u64) -> Dgram {
        Dgram::new(
            DgramHeader::new(PulseId::new(pid), TransitionKind::L1Accept, 1, 0x1),
            vec![7; 32],
        )
    }

    fn decode_batch(bytes: &[u8]) -> Vec<Dgram> {
        let mut out = Vec::new();
        for chunk in bytes.chunks(MAX_INPUT) {
            let (dg, _) = Dgram::decode(chunk).unwrap();
            let eol = dg.header.is_eol();
            out.push(dg);
            if eol {
                break;
            }
        }
        out
    }

    #[test]
    fn test_window_expiry_posts_batch() {
        let (mut ctrb, servers) = harness(1);
        for pid in 0..8u64 {
            ctrb.process(l1(pid), 0).unwrap();
        }
        assert!(servers[0].poll().is_none(), "window still open");
        ctrb.process(l1(8), 0).unwrap(); // crosses the epoch boundary
        let d = servers[0].poll().expect("batch posted");
        let entries = decode_batch(&d.bytes);
        assert_eq!(entries.len(), 8);
        assert!(entries[7].header.is_eol());
        assert_eq!(entries[0].pulse_id().raw(), 0);
        let imm = ImmData::decode(d.imm).unwrap();
        assert_eq!(imm.kind(), ImmKind::Buffer);
        assert!(imm.is_response());
        assert_eq!(imm.source(), 1);
        assert_eq!(d.offset, 0);
    }

    #[test]
    fn test_transition_flushes_batch_through_itself() {
        let (mut ctrb, servers) = harness(1);
        for pid in 0..=2u64 {
            ctrb.process(l1(pid), 0).unwrap();
        }
        let disable = Dgram::transition(PulseId::new(3), TransitionKind::Disable, 1, 0x1);
        ctrb.process(disable, 0).unwrap();
        let d = servers[0].poll().expect("flush posted");
        let entries = decode_batch(&d.bytes);
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[3].service().unwrap(),
            TransitionKind::Disable,
            "transition terminates the batch"
        );
        assert!(entries[3].header.is_eol());
    }

    #[test]
    fn test_transition_forwarded_no_response_to_other_peers() {
        let (mut ctrb, servers) = harness(3);
        ctrb.process(l1(0), 0).unwrap();
        let disable = Dgram::transition(PulseId::new(1), TransitionKind::Disable, 1, 0x1);
        ctrb.process(disable, 0).unwrap();

        // Peer 0 owns batch 0 and receives the batch with the transition.
        let batch = servers[0].poll().expect("selected peer got the batch");
        assert_eq!(ImmData::decode(batch.imm).unwrap().kind(), ImmKind::Buffer);
        assert!(servers[0].poll().is_none(), "no duplicate to selected peer");

        // The other peers get a NoResponse copy at the transition offset.
        for server in &servers[1..] {
            let d = server.poll().expect("forwarded transition");
            let imm = ImmData::decode(d.imm).unwrap();
            assert_eq!(imm.kind(), ImmKind::Transition);
            assert_eq!(imm.response(), crate::immdata::ImmResponse::NoResponse);
            let (dg, _) = Dgram::decode(&d.bytes).unwrap();
            assert_eq!(dg.service().unwrap(), TransitionKind::Disable);
        }
    }

    #[test]
    fn test_bypass_enqueues_with_eol_and_no_post() {
        let (mut ctrb, servers) = harness(1);
        let mut dg = l1(5);
        dg.header.readout_groups = 0x2; // Does not intersect common group 0x1
        ctrb.process(dg, 0).unwrap();
        assert!(servers[0].poll().is_none(), "bypass must not post");
        match ctrb.in_flight().pop().expect("bypass queued") {
            InFlight::Bypass { dgram } => {
                assert!(dgram.header.is_eol());
                assert_eq!(dgram.pulse_id().raw(), 5);
            }
            other => panic!("unexpected in-flight record {other:?}"),
        }
    }

    #[test]
    fn test_round_robin_across_peers() {
        let (mut ctrb, servers) = harness(3);
        // 9 windows of 8 pulses each; a tenth pulse flushes the ninth.
        for pid in 0..=(9 * 8) {
            ctrb.process(l1(pid), 0).unwrap();
        }
        let counts: Vec<usize> = servers
            .iter()
            .map(|s| std::iter::from_fn(|| s.poll()).count())
            .collect();
        assert_eq!(counts, vec![3, 3, 3]);
    }

    #[test]
    fn test_max_input_size_boundary() {
        let (mut ctrb, _servers) = harness(1);
        let fits = Dgram::new(
            DgramHeader::new(PulseId::new(0), TransitionKind::L1Accept, 1, 0x1),
            vec![0; MAX_INPUT - crate::datagram::DGRAM_HEADER_SIZE],
        );
        ctrb.process(fits, 0).unwrap();
        let too_big = Dgram::new(
            DgramHeader::new(PulseId::new(1), TransitionKind::L1Accept, 1, 0x1),
            vec![0; MAX_INPUT - crate::datagram::DGRAM_HEADER_SIZE + 1],
        );
        assert!(matches!(
            ctrb.process(too_big, 0),
            Err(EbError::Protocol(_))
        ));
    }

    #[test]
    fn test_source_mismatch_is_protocol_error() {
        let (mut ctrb, _servers) = harness(1);
        let mut dg = l1(0);
        dg.header.src = 9;
        assert!(matches!(ctrb.process(dg, 0), Err(EbError::Protocol(_))));
    }
}
