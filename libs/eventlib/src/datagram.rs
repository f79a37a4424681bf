// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Contribution datagrams
//!
//! A contribution is a fixed header plus a variable, opaque payload. The
//! header travels unmodified through batches, the event builder and the
//! monitor path; the payload is never interpreted by this crate.
//!
//! The header packs the pulse ID together with a control byte into a single
//! 64-bit word: bits `[55:0]` carry the pulse ID, bits `[62:56]` the
//! transition kind, bit `[63]` the end-of-list marker that terminates a
//! batch on the wire.

use bytemuck::{Pod, Zeroable};

use crate::error::{EbError, Result};
use crate::pulse::PulseId;

/// Transition kinds, in fixed wire order.
///
/// `L1Accept` is the only event transition; everything else describes a
/// change of the acquisition state machine and flushes in-progress batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TransitionKind {
    ClearReadout = 0,
    Reset = 1,
    Configure = 2,
    Unconfigure = 3,
    BeginRun = 4,
    EndRun = 5,
    BeginStep = 6,
    EndStep = 7,
    Enable = 8,
    Disable = 9,
    SlowUpdate = 10,
    L1Accept = 11,
}

/// Number of distinct transition kinds; sizes the per-kind transition
/// buffer regions.
pub const NUM_TRANSITIONS: usize = 12;

impl TransitionKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        use TransitionKind::*;
        Ok(match v {
            0 => ClearReadout,
            1 => Reset,
            2 => Configure,
            3 => Unconfigure,
            4 => BeginRun,
            5 => EndRun,
            6 => BeginStep,
            7 => EndStep,
            8 => Enable,
            9 => Disable,
            10 => SlowUpdate,
            11 => L1Accept,
            _ => return Err(EbError::Protocol(format!("unknown transition kind {v}"))),
        })
    }

    /// True for transitions that carry event data rather than state changes.
    pub fn is_event(self) -> bool {
        self == TransitionKind::L1Accept
    }

    pub fn name(self) -> &'static str {
        use TransitionKind::*;
        match self {
            ClearReadout => "ClearReadout",
            Reset => "Reset",
            Configure => "Configure",
            Unconfigure => "Unconfigure",
            BeginRun => "BeginRun",
            EndRun => "EndRun",
            BeginStep => "BeginStep",
            EndStep => "EndStep",
            Enable => "Enable",
            Disable => "Disable",
            SlowUpdate => "SlowUpdate",
            L1Accept => "L1Accept",
        }
    }
}

/// Accumulated per-event error flags. Damage survives retirement and is the
/// standard mechanism for surfacing partial failure downstream without
/// aborting the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct Damage(u16);

impl Damage {
    pub const NONE: Damage = Damage(0);
    pub const DROPPED_CONTRIBUTION: Damage = Damage(1 << 0);
    pub const OUT_OF_ORDER: Damage = Damage(1 << 1);
    pub const OUT_OF_SYNCH: Damage = Damage(1 << 2);
    pub const CORRUPTED: Damage = Damage(1 << 3);
    pub const TIMED_OUT: Damage = Damage(1 << 4);
    pub const MISSING_CONTRIBUTION: Damage = Damage(1 << 5);
    pub const USER_DEFINED: Damage = Damage(1 << 15);

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn from_value(v: u16) -> Self {
        Damage(v)
    }

    /// OR another damage set into this one.
    pub fn increase(&mut self, other: Damage) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: Damage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_clean(self) -> bool {
        self.0 == 0
    }
}

const SERVICE_SHIFT: u32 = 56;
const SERVICE_MASK: u64 = 0x7f << SERVICE_SHIFT;
const EOL_BIT: u64 = 1 << 63;
const PULSE_MASK: u64 = (1 << 56) - 1;

/// Monitor buffer index lives in env bits [23:16]; all other bits are
/// reserved for upstream uses and must be preserved round-trip.
const ENV_BUFFER_SHIFT: u32 = 16;
const ENV_BUFFER_MASK: u32 = 0xff << ENV_BUFFER_SHIFT;

/// Stash a monitor buffer index in an environment word, preserving the
/// reserved bits.
pub fn env_with_buffer_index(env: u32, index: u32) -> u32 {
    (env & !ENV_BUFFER_MASK) | ((index << ENV_BUFFER_SHIFT) & ENV_BUFFER_MASK)
}

/// Recover the monitor buffer index from an environment word.
pub fn buffer_index_from_env(env: u32) -> u32 {
    (env & ENV_BUFFER_MASK) >> ENV_BUFFER_SHIFT
}

/// Fixed-layout contribution header. 24 bytes on the wire, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DgramHeader {
    /// Pulse ID [55:0], transition kind [62:56], end-of-list marker [63].
    pub pulse_ctl: u64,
    /// Environment word; bits [23:16] carry the monitor buffer index.
    pub env: u32,
    /// Damage flags accumulated for this contribution.
    pub damage: u16,
    /// Contributor instance that produced this datagram.
    pub src: u16,
    /// Readout groups this contribution participates in.
    pub readout_groups: u16,
    pub _reserved: u16,
    /// Payload bytes following the header.
    pub extent: u32,
}

pub const DGRAM_HEADER_SIZE: usize = std::mem::size_of::<DgramHeader>();

const _: () = assert!(DGRAM_HEADER_SIZE == 24);

impl DgramHeader {
    pub fn new(pulse_id: PulseId, service: TransitionKind, src: usize, readout_groups: u16) -> Self {
        Self {
            pulse_ctl: (pulse_id.raw() & PULSE_MASK) | ((service as u64) << SERVICE_SHIFT),
            env: 0,
            damage: 0,
            src: src as u16,
            readout_groups,
            _reserved: 0,
            extent: 0,
        }
    }

    pub fn pulse_id(&self) -> PulseId {
        PulseId::new(self.pulse_ctl & PULSE_MASK)
    }

    pub fn service(&self) -> Result<TransitionKind> {
        TransitionKind::from_u8(((self.pulse_ctl & SERVICE_MASK) >> SERVICE_SHIFT) as u8)
    }

    /// Control byte: transition kind plus the end-of-list marker.
    pub fn control(&self) -> u8 {
        (self.pulse_ctl >> SERVICE_SHIFT) as u8
    }

    pub fn is_eol(&self) -> bool {
        self.pulse_ctl & EOL_BIT != 0
    }

    /// Set the end-of-list marker that terminates a batch on the wire.
    pub fn set_eol(&mut self) {
        self.pulse_ctl |= EOL_BIT;
    }

    pub fn clear_eol(&mut self) {
        self.pulse_ctl &= !EOL_BIT;
    }

    pub fn damage(&self) -> Damage {
        Damage::from_value(self.damage)
    }

    pub fn source(&self) -> usize {
        self.src as usize
    }
}

/// An owned contribution datagram: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dgram {
    pub header: DgramHeader,
    pub payload: Vec<u8>,
}

impl Dgram {
    pub fn new(header: DgramHeader, payload: Vec<u8>) -> Self {
        let mut header = header;
        header.extent = payload.len() as u32;
        Self { header, payload }
    }

    /// A payload-less datagram, as used for state transitions.
    pub fn transition(
        pulse_id: PulseId,
        kind: TransitionKind,
        src: usize,
        readout_groups: u16,
    ) -> Self {
        Self::new(DgramHeader::new(pulse_id, kind, src, readout_groups), Vec::new())
    }

    pub fn pulse_id(&self) -> PulseId {
        self.header.pulse_id()
    }

    pub fn service(&self) -> Result<TransitionKind> {
        self.header.service()
    }

    pub fn is_event(&self) -> bool {
        matches!(self.header.service(), Ok(k) if k.is_event())
    }

    /// Total size on the wire.
    pub fn size(&self) -> usize {
        DGRAM_HEADER_SIZE + self.payload.len()
    }

    /// Serialize into `buf` at its current end.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(bytemuck::bytes_of(&self.header));
        buf.extend_from_slice(&self.payload);
    }

    /// Deserialize one datagram from the start of `bytes`.
    ///
    /// Returns the datagram and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Dgram, usize)> {
        if bytes.len() < DGRAM_HEADER_SIZE {
            return Err(EbError::Protocol(format!(
                "datagram truncated: {} bytes",
                bytes.len()
            )));
        }
        let header: DgramHeader =
            bytemuck::pod_read_unaligned(&bytes[..DGRAM_HEADER_SIZE]);
        header.service()?; // Reject undefined transition kinds early
        let extent = header.extent as usize;
        if bytes.len() < DGRAM_HEADER_SIZE + extent {
            return Err(EbError::Protocol(format!(
                "datagram payload truncated: want {extent}, have {}",
                bytes.len() - DGRAM_HEADER_SIZE
            )));
        }
        let payload = bytes[DGRAM_HEADER_SIZE..DGRAM_HEADER_SIZE + extent].to_vec();
        Ok((Dgram { header, payload }, DGRAM_HEADER_SIZE + extent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dgram(pid: u64, kind: TransitionKind) -> Dgram {
        Dgram::new(
            DgramHeader::new(PulseId::new(pid), kind, 2, 0x1),
            vec![0xab; 16],
        )
    }

    #[test]
    fn test_header_round_trip() {
        let dg = dgram(0x1234, TransitionKind::L1Accept);
        assert_eq!(dg.pulse_id().raw(), 0x1234);
        assert_eq!(dg.service().unwrap(), TransitionKind::L1Accept);
        assert_eq!(dg.header.source(), 2);
        assert!(dg.is_event());
    }

    #[test]
    fn test_eol_marker() {
        let mut dg = dgram(7, TransitionKind::SlowUpdate);
        assert!(!dg.header.is_eol());
        dg.header.set_eol();
        assert!(dg.header.is_eol());
        // Pulse ID and service survive the marker
        assert_eq!(dg.pulse_id().raw(), 7);
        assert_eq!(dg.service().unwrap(), TransitionKind::SlowUpdate);
    }

    #[test]
    fn test_encode_decode() {
        let mut dg = dgram(99, TransitionKind::L1Accept);
        dg.header.set_eol();
        let mut buf = Vec::new();
        dg.encode_into(&mut buf);
        let (back, used) = Dgram::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(back, dg);
    }

    #[test]
    fn test_decode_truncated() {
        let dg = dgram(1, TransitionKind::L1Accept);
        let mut buf = Vec::new();
        dg.encode_into(&mut buf);
        assert!(Dgram::decode(&buf[..10]).is_err());
        assert!(Dgram::decode(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn test_env_buffer_index_preserves_reserved_bits() {
        let env = 0xdead_beef;
        let stamped = env_with_buffer_index(env, 0x42);
        assert_eq!(buffer_index_from_env(stamped), 0x42);
        assert_eq!(stamped & 0xff00_ffff, env & 0xff00_ffff);
    }

    #[test]
    fn test_damage_accumulates() {
        let mut d = Damage::NONE;
        d.increase(Damage::TIMED_OUT);
        d.increase(Damage::MISSING_CONTRIBUTION);
        assert!(d.contains(Damage::MISSING_CONTRIBUTION));
        assert!(d.contains(Damage::TIMED_OUT));
        assert!(!d.contains(Damage::CORRUPTED));
    }
}
