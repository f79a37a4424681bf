// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The monitor event builder
//!
//! Wires the matching engine to the fan-out server: contributions arrive
//! over the fabric endpoint this process serves, the engine assembles them
//! into events using the readout-group contract map, and completed events
//! land in shared memory for consumers. Buffer requests flow back to the
//! trigger event builders over the request links.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use eventlib::builder::{EventBuilder, EventBuilderConfig};
use eventlib::config::MebParams;
use eventlib::datagram::{Dgram, NUM_TRANSITIONS};
use eventlib::error::Result;
use eventlib::immdata::ImmData;
use eventlib::link::{Delivery, FabricLink, LoopbackFabric, LoopbackServer, CONNECT_TIMEOUT};
use eventlib::monitor::{MebPolicy, MonitorServer, MonitorServerConfig};
use eventlib::{affinity, pulse};

/// How often the ageing timer fires. A fraction of the latency bound so an
/// abandoned event expires well before its batch slot is needed again.
const AGEING_INTERVAL: Duration = Duration::from_micros(pulse::MAX_LATENCY / 4);

/// Epoch width used on the monitor path; one event per buffer, narrow
/// epochs keep retirement prompt.
const EPOCH_DURATION: u64 = 8;

/// Control requests delivered to the running receive loop.
#[derive(Debug, Clone, Copy)]
pub enum MebCommand {
    /// Reset per-run counters without touching connections.
    BeginRun,
}

pub struct Meb {
    builder: EventBuilder<MebPolicy>,
    endpoint: LoopbackServer,
    core: i32,
}

impl Meb {
    /// Build the engine, the fan-out server and the request links.
    pub fn configure(
        fabric: &LoopbackFabric,
        prms: &MebParams,
        num_ev_queues: usize,
        distribute: bool,
        tag: &str,
    ) -> Result<Self> {
        // Contributions land in per-buffer slots; transitions in dedicated
        // slots past them.
        let max_tr_size = prms.eb.max_tr_size.iter().copied().max().unwrap_or(0);
        let region_size = prms.num_ev_buffers * prms.max_buffer_size
            + NUM_TRANSITIONS * max_tr_size.max(prms.max_buffer_size);
        let endpoint = fabric.serve(&format!("meb{}", prms.eb.id), prms.eb.id, region_size);

        let mut server = MonitorServer::new(MonitorServerConfig {
            id: prms.eb.id,
            tag: format!("/{}-{}-{}", tag, prms.eb.partition, prms.eb.id),
            num_ev_buffers: prms.num_ev_buffers,
            max_buffer_size: prms.max_buffer_size,
            num_ev_queues,
            distribute,
        })?;

        let mut mrq_links: Vec<std::sync::Arc<dyn FabricLink>> = Vec::new();
        for (addr, port) in prms.eb.addrs.iter().zip(&prms.eb.ports) {
            let link = fabric.connect(&format!("{addr}:{port}"), CONNECT_TIMEOUT)?;
            tracing::info!(teb = link.id(), %addr, port, "request link connected");
            mrq_links.push(link);
        }
        server.configure(mrq_links)?;

        let policy = MebPolicy::new(prms.eb.contractors, server);
        let builder = EventBuilder::new(
            EventBuilderConfig {
                epochs: prms.num_ev_buffers.next_power_of_two(),
                entries: EPOCH_DURATION as usize,
                sources: pulse::MAX_SOURCES,
                batch_duration: EPOCH_DURATION,
                ..Default::default()
            },
            policy,
        );

        Ok(Self {
            builder,
            endpoint,
            core: prms.eb.core[0],
        })
    }

    /// Receive loop: poll the endpoint, drive ageing, drain releases.
    ///
    /// Runs until `running` clears; a protocol error raised on the publish
    /// path aborts with the error.
    pub fn run(
        &mut self,
        running: &AtomicBool,
        commands: &crossbeam_channel::Receiver<MebCommand>,
    ) -> Result<()> {
        tracing::info!("MEB thread is starting");
        if let Err(err) = affinity::pin_current_thread(self.core) {
            tracing::error!(%err, "failed to pin MEB thread");
        }

        let mut last_tick = Instant::now();
        while running.load(Ordering::Acquire) {
            while let Ok(cmd) = commands.try_recv() {
                match cmd {
                    MebCommand::BeginRun => self.beginrun(),
                }
            }
            if let Some(delivery) = self.endpoint.poll_timeout(Duration::from_millis(1)) {
                self.on_delivery(delivery)?;
            }
            self.builder.policy_mut().server_mut().poll_releases();
            if let Some(fatal) = self.builder.policy_mut().take_fatal() {
                return Err(fatal);
            }
            if last_tick.elapsed() >= AGEING_INTERVAL {
                self.builder.expired();
                last_tick = Instant::now();
            }
        }

        self.shutdown();
        tracing::info!("MEB thread is exiting");
        Ok(())
    }

    fn on_delivery(&mut self, delivery: Delivery) -> Result<()> {
        let imm = ImmData::decode(delivery.imm)?;
        let (dg, _) = Dgram::decode(&delivery.bytes)?;
        // The immediate word travels as the event's free parameter so the
        // publish path can recover the destination buffer.
        self.builder
            .process_contribution(dg, imm.encode() as u64)
    }

    fn beginrun(&mut self) {
        tracing::info!("run starting, counters reset");
        self.builder.policy_mut().server_mut().reset_counts();
    }

    fn shutdown(&mut self) {
        self.builder.policy_mut().server_mut().shutdown();
        self.builder.dump();
    }
}
