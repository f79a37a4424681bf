// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Fabric links
//!
//! The fabric transport itself lives outside this crate; what the event
//! builder needs from it is narrow: a prepared link writes a buffer to a
//! remote offset with a 32-bit immediate word attached, and reports failure
//! with a negative return code that aborts the post but never the process.
//!
//! [`FabricLink`] captures that contract. [`LoopbackFabric`] is an
//! in-process implementation used by the integration tests and by
//! single-host deployments: endpoints register under a name, connections
//! block until the named peer appears (bounded by the handshake timeout),
//! and posts are delivered over a bounded channel that models the send
//! queue depth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::error::{EbError, Result};
use crate::immdata::ImmData;

/// Connection establishment deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default per-link send queue depth.
pub const SEND_QUEUE_DEPTH: usize = 1024;

/// One post as seen by the receiving endpoint.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Payload bytes, written at `offset` in the receiver's region.
    pub bytes: Vec<u8>,
    /// Remote write offset.
    pub offset: usize,
    /// Encoded immediate word.
    pub imm: u32,
}

/// A prepared, outbound fabric link.
pub trait FabricLink: Send + Sync {
    /// Identity of the remote peer.
    fn id(&self) -> usize;

    /// Write `buf` at `offset` in the remote region, attaching `imm`.
    ///
    /// Returns 0 on success and a negative code on transport failure.
    fn post(&self, buf: &[u8], offset: usize, imm: ImmData) -> i32;

    /// Posts accepted but not yet drained by the receiver.
    fn pending(&self) -> usize;
}

struct Registration {
    tx: Sender<Delivery>,
    id: usize,
    region_size: usize,
}

struct Hub {
    endpoints: Mutex<HashMap<String, Registration>>,
    registered: Condvar,
}

/// In-process fabric. Clone-cheap; all clones share one endpoint namespace.
#[derive(Clone)]
pub struct LoopbackFabric {
    hub: Arc<Hub>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                endpoints: Mutex::new(HashMap::new()),
                registered: Condvar::new(),
            }),
        }
    }

    /// Register a receiving endpoint under `name`.
    ///
    /// `region_size` is the size of the memory region remote peers may
    /// write into; posts beyond it are rejected at the sender.
    pub fn serve(&self, name: &str, id: usize, region_size: usize) -> LoopbackServer {
        let (tx, rx) = bounded(SEND_QUEUE_DEPTH);
        let mut eps = self.hub.endpoints.lock();
        eps.insert(
            name.to_string(),
            Registration {
                tx,
                id,
                region_size,
            },
        );
        self.hub.registered.notify_all();
        LoopbackServer { rx, id }
    }

    /// Connect to the endpoint registered under `name`.
    ///
    /// Blocks until the endpoint appears or `timeout` elapses.
    pub fn connect(&self, name: &str, timeout: Duration) -> Result<Arc<LoopbackLink>> {
        let deadline = Instant::now() + timeout;
        let mut eps = self.hub.endpoints.lock();
        loop {
            if let Some(reg) = eps.get(name) {
                return Ok(Arc::new(LoopbackLink {
                    peer: reg.id,
                    region_size: reg.region_size,
                    tx: reg.tx.clone(),
                    posted: AtomicU64::new(0),
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EbError::ConnectTimeout(name.to_string()));
            }
            if self
                .hub
                .registered
                .wait_until(&mut eps, deadline)
                .timed_out()
            {
                return Err(EbError::ConnectTimeout(name.to_string()));
            }
        }
    }

    /// Remove the endpoint registered under `name`.
    pub fn unregister(&self, name: &str) {
        self.hub.endpoints.lock().remove(name);
    }
}

/// Receiving side of a loopback endpoint. Polled, never blocking.
pub struct LoopbackServer {
    rx: Receiver<Delivery>,
    id: usize,
}

impl LoopbackServer {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Non-blocking poll for the next delivery.
    pub fn poll(&self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Poll with a bounded wait, for receive loops that must also observe
    /// a shutdown flag.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Delivery> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Outbound side of a loopback connection.
pub struct LoopbackLink {
    peer: usize,
    region_size: usize,
    tx: Sender<Delivery>,
    posted: AtomicU64,
}

impl LoopbackLink {
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn post_count(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }
}

impl FabricLink for LoopbackLink {
    fn id(&self) -> usize {
        self.peer
    }

    fn post(&self, buf: &[u8], offset: usize, imm: ImmData) -> i32 {
        if !buf.is_empty() && offset + buf.len() > self.region_size {
            return -2;
        }
        let delivery = Delivery {
            bytes: buf.to_vec(),
            offset,
            imm: imm.encode(),
        };
        match self.tx.try_send(delivery) {
            Ok(()) => {
                self.posted.fetch_add(1, Ordering::Relaxed);
                0
            }
            Err(TrySendError::Full(_)) => -11,
            Err(TrySendError::Disconnected(_)) => -1,
        }
    }

    fn pending(&self) -> usize {
        self.tx.len()
    }
}
