// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared-memory transfer region
//!
//! The monitor fan-out hands built events to consumer processes through a
//! POSIX shared-memory segment. The segment starts with a control block
//! (metadata plus lock-free index rings) followed by the data segment:
//! `num_buffers` event slots of `buffer_size` bytes each, slot N at offset
//! `N * buffer_size`, then one dedicated slot per transition kind. Event
//! slots circulate through the credit protocol; transition slots are
//! broadcast and never counted against the event buffers.
//!
//! Index rings are single-producer single-consumer: each consumer queue is
//! written by the server and drained by one consumer, and the release ring
//! is written by consumers and drained by the server. Indices are `u32`;
//! values at or above `num_buffers` address transition slots.

use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::datagram::NUM_TRANSITIONS;
use crate::error::{EbError, Result};

/// Capacity of each index ring. Buffer counts are limited to 255 by the
/// environment-word encoding, so 256 slots never fill.
pub const RING_SLOTS: usize = 256;

const MAGIC: u32 = 0x4542_4d53; // "EBMS"
const VERSION: u32 = 1;

/// Page-aligned start of the data segment.
const PAGE: usize = 4096;

/// Fixed metadata written once by the server at creation.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ControlHeader {
    pub magic: u32,
    pub version: u32,
    pub num_buffers: u32,
    pub num_queues: u32,
    pub buffer_size: u64,
    pub distribute: u32,
    pub _pad: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<ControlHeader>();

/// One lock-free SPSC index ring, resident in shared memory.
#[repr(C)]
pub struct ShmRing {
    head: AtomicU32,
    tail: AtomicU32,
    slots: [AtomicU32; RING_SLOTS],
}

const RING_SIZE: usize = std::mem::size_of::<ShmRing>();

impl ShmRing {
    fn init(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    /// Push an index; false when the ring is full.
    pub fn push(&self, value: u32) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) as usize >= RING_SLOTS {
            return false;
        }
        self.slots[tail as usize % RING_SLOTS].store(value, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop the oldest index; `None` when empty.
    pub fn pop(&self) -> Option<u32> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = self.slots[head as usize % RING_SLOTS].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A mapped POSIX shared-memory segment.
pub struct ShmemRegion {
    name: String,
    ptr: *mut u8,
    len: usize,
    owner: bool,
}

// The region is raw memory; synchronization is the responsibility of the
// structures placed inside it.
unsafe impl Send for ShmemRegion {}
unsafe impl Sync for ShmemRegion {}

impl ShmemRegion {
    /// Create (or replace) a segment of `len` bytes under `name`.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        Self::map(name, len, true)
    }

    /// Attach to an existing segment.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        Self::map(name, len, false)
    }

    fn map(name: &str, len: usize, owner: bool) -> Result<Self> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| EbError::Shmem(format!("bad segment name {name:?}")))?;
        unsafe {
            let mut flags = libc::O_RDWR;
            if owner {
                flags |= libc::O_CREAT;
            }
            let fd = libc::shm_open(c_name.as_ptr(), flags, 0o600);
            if fd < 0 {
                return Err(EbError::Shmem(format!(
                    "shm_open({name}) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if owner && libc::ftruncate(fd, len as libc::off_t) < 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(EbError::Shmem(format!("ftruncate({name}) failed: {err}")));
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                if owner {
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(EbError::Shmem(format!("mmap({name}) failed: {err}")));
            }
            Ok(Self {
                name: name.to_string(),
                ptr: ptr as *mut u8,
                len,
                owner,
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Mutable view of a sub-range. Callers must not alias ranges across
    /// threads; slot ownership is enforced by the credit protocol.
    #[allow(clippy::mut_from_ref)]
    fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }

    fn ring(&self, offset: usize) -> &ShmRing {
        assert!(offset + RING_SIZE <= self.len);
        assert!(offset % std::mem::align_of::<ShmRing>() == 0);
        unsafe { &*(self.ptr.add(offset) as *const ShmRing) }
    }
}

impl Drop for ShmemRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
            if self.owner {
                if let Ok(c_name) = std::ffi::CString::new(self.name.as_str()) {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

/// Geometry of a transfer segment.
#[derive(Debug, Clone)]
pub struct TransferLayout {
    pub num_buffers: usize,
    pub num_queues: usize,
    pub buffer_size: usize,
}

impl TransferLayout {
    fn control_size(&self) -> usize {
        // Header, release ring, one ring per consumer queue.
        let raw = HEADER_SIZE + RING_SIZE * (1 + self.num_queues);
        raw.div_ceil(PAGE) * PAGE
    }

    fn data_size(&self) -> usize {
        (self.num_buffers + NUM_TRANSITIONS) * self.buffer_size
    }

    pub fn total_size(&self) -> usize {
        self.control_size() + self.data_size()
    }

    fn release_ring_offset(&self) -> usize {
        HEADER_SIZE
    }

    fn consumer_ring_offset(&self, queue: usize) -> usize {
        HEADER_SIZE + RING_SIZE * (1 + queue)
    }

    fn buffer_offset(&self, index: usize) -> usize {
        self.control_size() + index * self.buffer_size
    }
}

/// Server or consumer view of the transfer segment.
pub struct TransferRegion {
    region: ShmemRegion,
    layout: TransferLayout,
}

impl TransferRegion {
    /// Create the segment and initialize its control block.
    pub fn create(name: &str, layout: TransferLayout, distribute: bool) -> Result<Self> {
        let region = ShmemRegion::create(name, layout.total_size())?;
        let header = ControlHeader {
            magic: MAGIC,
            version: VERSION,
            num_buffers: layout.num_buffers as u32,
            num_queues: layout.num_queues as u32,
            buffer_size: layout.buffer_size as u64,
            distribute: distribute as u32,
            _pad: 0,
        };
        region.slice_mut(0, HEADER_SIZE).copy_from_slice(bytemuck::bytes_of(&header));
        let this = Self { region, layout };
        this.release_ring().init();
        for q in 0..this.layout.num_queues {
            this.consumer_ring(q).init();
        }
        Ok(this)
    }

    /// Attach to a segment created by a server, validating its header.
    pub fn open(name: &str, layout: TransferLayout) -> Result<Self> {
        let region = ShmemRegion::open(name, layout.total_size())?;
        let header: ControlHeader =
            bytemuck::pod_read_unaligned(region.slice(0, HEADER_SIZE));
        if header.magic != MAGIC || header.version != VERSION {
            return Err(EbError::Shmem(format!(
                "segment {name} has unexpected control block (magic {:08x})",
                header.magic
            )));
        }
        if header.num_buffers as usize != layout.num_buffers
            || header.num_queues as usize != layout.num_queues
            || header.buffer_size as usize != layout.buffer_size
        {
            return Err(EbError::Shmem(format!(
                "segment {name} geometry mismatch"
            )));
        }
        Ok(Self { region, layout })
    }

    pub fn layout(&self) -> &TransferLayout {
        &self.layout
    }

    /// Released buffer indices flowing back from consumers.
    pub fn release_ring(&self) -> &ShmRing {
        self.region.ring(self.layout.release_ring_offset())
    }

    /// The index ring feeding consumer `queue`.
    pub fn consumer_ring(&self, queue: usize) -> &ShmRing {
        assert!(queue < self.layout.num_queues);
        self.region.ring(self.layout.consumer_ring_offset(queue))
    }

    /// Event buffer slot, or transition slot for `index >= num_buffers`.
    pub fn buffer(&self, index: usize) -> &[u8] {
        assert!(index < self.layout.num_buffers + NUM_TRANSITIONS);
        self.region
            .slice(self.layout.buffer_offset(index), self.layout.buffer_size)
    }

    /// Mutable event buffer slot. The credit protocol guarantees a slot has
    /// a single writer while it is out of the free list.
    #[allow(clippy::mut_from_ref)]
    pub fn buffer_mut(&self, index: usize) -> &mut [u8] {
        assert!(index < self.layout.num_buffers + NUM_TRANSITIONS);
        self.region
            .slice_mut(self.layout.buffer_offset(index), self.layout.buffer_size)
    }

    /// Slot index used for broadcasts of transition `kind`.
    pub fn transition_slot(&self, kind: u8) -> usize {
        self.layout.num_buffers + kind as usize
    }
}
