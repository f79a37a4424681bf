// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! # eventlib - Event Building for Distributed Data Acquisition
//!
//! The event-builder core of a streaming DAQ system: contributions from
//! data-producing nodes are batched by pulse-ID window, round-robined
//! across event-builder peers over a flow-controlled fabric, matched into
//! events by contract, and fanned out to monitoring consumers through a
//! shared-memory ring.
//!
//! ## Architecture
//!
//! ```text
//! producer -> batch (window)  -> contributor (post)  ──fabric──┐
//!                                                              v
//! consumer <- monitor fan-out <- trigger policy <- event builder
//! ```
//!
//! - [`pulse`]: the pulse-ID time domain and sizing constants
//! - [`datagram`]: contribution headers, transitions, damage
//! - [`pool`], [`queue`]: fixed pools, lock-free queues, the slot LUT
//! - [`batch`]: pulse-window batching and slot accounting
//! - [`contributor`]: batching state machine and peer posting
//! - [`builder`]: the two-level epoch/event matching engine
//! - [`monitor`]: shared-memory fan-out with buffer credits
//! - [`link`]: the fabric contract and an in-process loopback
//!
//! Threads hand work to each other through lock-free queues and atomic
//! flags only; no suspension point holds a builder lock.

pub mod affinity;
pub mod batch;
pub mod builder;
pub mod config;
pub mod contributor;
pub mod datagram;
pub mod error;
pub mod immdata;
pub mod link;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod pulse;
pub mod queue;
pub mod shmem;

pub use batch::{Batch, BatchManager, BatchManagerConfig};
pub use builder::{EbEvent, EventBuilder, EventBuilderConfig, TriggerPolicy, LIVING_INIT};
pub use contributor::{Contributor, ContributorConfig, InFlight};
pub use datagram::{Damage, Dgram, DgramHeader, TransitionKind};
pub use error::{EbError, Result};
pub use immdata::{ImmData, ImmKind, ImmResponse};
pub use link::{Delivery, FabricLink, LoopbackFabric, LoopbackLink, LoopbackServer};
pub use monitor::{
    Disposition, MebPolicy, MonitorConsumer, MonitorServer, MonitorServerConfig,
};
pub use pulse::PulseId;
