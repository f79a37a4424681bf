// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end tests of the contribution -> batch -> build pipeline over the
//! in-process fabric.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use eventlib::batch::{BatchManager, BatchManagerConfig};
use eventlib::builder::{EbEvent, EventBuilder, EventBuilderConfig, TriggerPolicy};
use eventlib::contributor::{Contributor, ContributorConfig, InFlight};
use eventlib::datagram::{Damage, Dgram, DgramHeader, TransitionKind};
use eventlib::immdata::{ImmData, ImmKind, ImmResponse};
use eventlib::link::{FabricLink, LoopbackFabric, LoopbackServer};
use eventlib::pulse::PulseId;
use eventlib::queue::InFlightQueue;

const MAX_INPUT: usize = 256;
const DURATION: u64 = 64;

#[derive(Debug, Clone)]
struct BuiltEvent {
    pid: u64,
    damage: u16,
    remaining: u64,
    sources: Vec<usize>,
}

type Built = Arc<Mutex<Vec<BuiltEvent>>>;

struct Recorder {
    contract: u64,
    built: Built,
}

impl TriggerPolicy for Recorder {
    fn contract(&self, _dg: &Dgram) -> u64 {
        self.contract
    }

    fn fixup(&mut self, _event: &EbEvent, _src: usize) -> Option<Dgram> {
        None
    }

    fn process(&mut self, event: &EbEvent) {
        self.built.lock().push(BuiltEvent {
            pid: event.sequence().raw(),
            damage: event.damage().value(),
            remaining: event.remaining(),
            sources: event
                .contributions()
                .iter()
                .map(|dg| dg.header.source())
                .collect(),
        });
    }
}

struct Harness {
    contributors: Vec<Contributor>,
    teb: LoopbackServer,
    builder: EventBuilder<Recorder>,
    built: Built,
}

fn harness(num_sources: usize) -> Harness {
    let fabric = LoopbackFabric::new();
    let batch_cfg = BatchManagerConfig {
        batch_duration: DURATION,
        max_batches: 16,
        max_entries: DURATION as usize,
        max_input_size: MAX_INPUT,
        batching: true,
    };
    let region = BatchManager::new(batch_cfg.clone()).region_size_with_transitions();
    let teb = fabric.serve("teb0", 0, region);

    let contributors = (0..num_sources)
        .map(|id| {
            let batman = Arc::new(BatchManager::new(batch_cfg.clone()));
            let link: Arc<dyn FabricLink> =
                fabric.connect("teb0", Duration::from_secs(1)).unwrap();
            Contributor::new(
                ContributorConfig {
                    id,
                    common_group: 0x1,
                    contractor: 0x1,
                },
                batman,
                vec![link],
                Arc::new(InFlightQueue::new(64)),
            )
        })
        .collect();

    let built: Built = Default::default();
    let builder = EventBuilder::new(
        EventBuilderConfig {
            epochs: 8,
            entries: DURATION as usize,
            sources: num_sources,
            batch_duration: DURATION,
            living_init: 2,
            lookahead: DURATION as usize,
        },
        Recorder {
            contract: (1 << num_sources) - 1,
            built: built.clone(),
        },
    );

    Harness {
        contributors,
        teb,
        builder,
        built,
    }
}

fn l1(pid: u64, src: usize) -> Dgram {
    Dgram::new(
        DgramHeader::new(PulseId::new(pid), TransitionKind::L1Accept, src, 0x1),
        pid.to_le_bytes().to_vec(),
    )
}

/// Feed every delivery currently at the peer into the event builder.
fn drain_into_builder(h: &mut Harness) {
    while let Some(delivery) = h.teb.poll() {
        let imm = ImmData::decode(delivery.imm).unwrap();
        if imm.kind() != ImmKind::Buffer {
            continue;
        }
        for chunk in delivery.bytes.chunks(MAX_INPUT) {
            let (dg, _) = Dgram::decode(chunk).unwrap();
            let eol = dg.header.is_eol();
            h.builder
                .process_contribution(dg, imm.encode() as u64)
                .unwrap();
            if eol {
                break;
            }
        }
    }
}

#[test]
fn happy_path_builds_all_events_in_order() {
    let mut h = harness(4);
    for src in 0..4 {
        for pid in 100..164u64 {
            h.contributors[src].process(l1(pid, src), pid).unwrap();
        }
        h.contributors[src].shutdown().unwrap(); // Flush the open batch
    }
    drain_into_builder(&mut h);

    let built = h.built.lock();
    assert_eq!(built.len(), 64);
    for (i, ev) in built.iter().enumerate() {
        assert_eq!(ev.pid, 100 + i as u64, "emission in pulse order");
        assert_eq!(ev.damage, 0);
        assert_eq!(ev.remaining, 0);
        assert_eq!(ev.sources.len(), 4, "all contributions present");
    }
}

#[test]
fn silent_contributor_ages_out_with_damage() {
    let mut h = harness(4);
    for src in 0..4 {
        // Contributor 2 falls silent from pid 132 onward.
        let last = if src == 2 { 132 } else { 164 };
        for pid in 100..last {
            h.contributors[src].process(l1(pid, src), pid).unwrap();
        }
        h.contributors[src].shutdown().unwrap();
    }
    drain_into_builder(&mut h);

    // 100..131 complete on their own; the rest need the ageing timer.
    assert_eq!(h.built.lock().len(), 32);
    for _ in 0..2 * 32 {
        h.builder.expired();
    }

    let built = h.built.lock();
    assert_eq!(built.len(), 64);
    for ev in &built[..32] {
        assert_eq!(ev.damage, 0);
        assert_eq!(ev.sources.len(), 4);
    }
    for ev in &built[32..] {
        assert_ne!(
            ev.damage & Damage::MISSING_CONTRIBUTION.value(),
            0,
            "pid {} must carry missing-contribution damage",
            ev.pid
        );
        assert_eq!(ev.remaining, 0, "fixup clears the missing bit");
        assert_eq!(ev.sources.len(), 3);
        assert!(!ev.sources.contains(&2));
    }
    assert!(built.windows(2).all(|w| w[0].pid < w[1].pid));
}

#[test]
fn disable_flushes_batch_and_synchronizes_peers() {
    // One contributor, three peers: the batch goes to the selected peer
    // with the Disable as its terminating member, the others get a
    // NoResponse copy.
    let fabric = LoopbackFabric::new();
    let batch_cfg = BatchManagerConfig {
        batch_duration: DURATION,
        max_batches: 16,
        max_entries: DURATION as usize,
        max_input_size: MAX_INPUT,
        batching: true,
    };
    let batman = Arc::new(BatchManager::new(batch_cfg));
    let region = batman.region_size_with_transitions();
    let servers: Vec<LoopbackServer> = (0..3)
        .map(|peer| fabric.serve(&format!("teb{peer}"), peer, region))
        .collect();
    let links: Vec<Arc<dyn FabricLink>> = (0..3)
        .map(|peer| {
            let link: Arc<dyn FabricLink> = fabric
                .connect(&format!("teb{peer}"), Duration::from_secs(1))
                .unwrap();
            link
        })
        .collect();
    let mut ctrb = Contributor::new(
        ContributorConfig {
            id: 0,
            common_group: 0x1,
            contractor: 0x1,
        },
        batman,
        links,
        Arc::new(InFlightQueue::new(64)),
    );

    for pid in 100..=110u64 {
        ctrb.process(l1(pid, 0), pid).unwrap();
    }
    ctrb.process(
        Dgram::transition(PulseId::new(111), TransitionKind::Disable, 0, 0x1),
        111,
    )
    .unwrap();

    // Pulses 100..=111 live in epoch 1, batch slot 1, peer 1 % 3.
    let selected = 1usize;
    let delivery = servers[selected].poll().expect("selected peer got the batch");
    let imm = ImmData::decode(delivery.imm).unwrap();
    assert_eq!(imm.kind(), ImmKind::Buffer);
    assert!(imm.is_response());

    let entries: Vec<Dgram> = delivery
        .bytes
        .chunks(MAX_INPUT)
        .map(|chunk| Dgram::decode(chunk).unwrap().0)
        .collect();
    assert_eq!(entries.len(), 12);
    assert_eq!(entries[11].service().unwrap(), TransitionKind::Disable);
    assert!(entries[11].header.is_eol());

    for (peer, server) in servers.iter().enumerate() {
        if peer == selected {
            assert!(server.poll().is_none());
            continue;
        }
        let d = server.poll().expect("non-selected peer got the transition");
        let imm = ImmData::decode(d.imm).unwrap();
        assert_eq!(imm.kind(), ImmKind::Transition);
        assert_eq!(imm.response(), ImmResponse::NoResponse);
        let (dg, _) = Dgram::decode(&d.bytes).unwrap();
        assert_eq!(dg.service().unwrap(), TransitionKind::Disable);
        assert!(server.poll().is_none());
    }
}

#[test]
fn bypass_contribution_skips_the_builder() {
    let mut h = harness(1);
    let mut dg = l1(100, 0);
    dg.header.readout_groups = 0x4; // No overlap with the common group
    h.contributors[0].process(dg, 100).unwrap();

    assert!(h.teb.poll().is_none(), "nothing posted");
    match h.contributors[0].in_flight().pop() {
        Some(InFlight::Bypass { dgram }) => {
            assert!(dgram.header.is_eol());
            assert_eq!(dgram.pulse_id().raw(), 100);
        }
        other => panic!("expected a bypass record, got {other:?}"),
    }
}

#[test]
fn replaying_a_stream_yields_identical_batch_boundaries() {
    let stream: Vec<Dgram> = (0..200u64)
        .map(|pid| {
            if pid % 50 == 49 {
                Dgram::transition(PulseId::new(pid), TransitionKind::SlowUpdate, 0, 0x1)
            } else {
                l1(pid, 0)
            }
        })
        .collect();

    let run = |stream: &[Dgram]| -> Vec<(u32, usize, usize)> {
        let mut h = harness(1);
        for dg in stream {
            h.contributors[0].process(dg.clone(), 0).unwrap();
        }
        h.contributors[0].shutdown().unwrap();
        let mut posts = Vec::new();
        while let Some(d) = h.teb.poll() {
            let imm = ImmData::decode(d.imm).unwrap();
            posts.push((imm.index(), d.offset, d.bytes.len()));
        }
        posts
    };

    let first = run(&stream);
    let second = run(&stream);
    assert!(!first.is_empty());
    assert_eq!(first, second);
}
