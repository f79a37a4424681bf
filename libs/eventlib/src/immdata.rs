// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Immediate-data side channel
//!
//! Every fabric post carries a 32-bit immediate word so the receiver can
//! locate the destination slot without reading the payload. Wire layout
//! (little-endian): `bits[31:24]` flags, `bits[23:16]` source id,
//! `bits[15:0]` index.

use crate::error::{EbError, Result};

/// What the post carries: a buffer (batch / built event) or a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmKind {
    Buffer,
    Transition,
}

/// Whether the receiver is expected to respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmResponse {
    /// No response indication was encoded.
    Unspecified,
    /// The selected peer must emit a result for this post.
    Response,
    /// Forwarded for synchronization only; no result expected.
    NoResponse,
}

const FLAG_BUFFER: u8 = 0x01;
const FLAG_TRANSITION: u8 = 0x02;
const FLAG_RESPONSE: u8 = 0x04;
const FLAG_NO_RESPONSE: u8 = 0x08;

/// Decoded immediate word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmData {
    kind: ImmKind,
    response: ImmResponse,
    source: u8,
    index: u16,
}

impl ImmData {
    pub fn buffer(response: ImmResponse, source: usize, index: u32) -> Self {
        Self {
            kind: ImmKind::Buffer,
            response,
            source: source as u8,
            index: index as u16,
        }
    }

    pub fn transition(response: ImmResponse, source: usize, index: u32) -> Self {
        Self {
            kind: ImmKind::Transition,
            response,
            source: source as u8,
            index: index as u16,
        }
    }

    pub fn kind(&self) -> ImmKind {
        self.kind
    }

    pub fn response(&self) -> ImmResponse {
        self.response
    }

    pub fn source(&self) -> usize {
        self.source as usize
    }

    pub fn index(&self) -> u32 {
        self.index as u32
    }

    pub fn is_buffer(&self) -> bool {
        self.kind == ImmKind::Buffer
    }

    pub fn is_response(&self) -> bool {
        self.response == ImmResponse::Response
    }

    /// Encode to the 32-bit wire representation.
    pub fn encode(&self) -> u32 {
        let mut flags = match self.kind {
            ImmKind::Buffer => FLAG_BUFFER,
            ImmKind::Transition => FLAG_TRANSITION,
        };
        match self.response {
            ImmResponse::Unspecified => {}
            ImmResponse::Response => flags |= FLAG_RESPONSE,
            ImmResponse::NoResponse => flags |= FLAG_NO_RESPONSE,
        }
        (flags as u32) << 24 | (self.source as u32) << 16 | self.index as u32
    }

    /// Decode from the 32-bit wire representation.
    ///
    /// Rejects words whose flag bits are not one of the defined
    /// combinations; such a word indicates a corrupted post.
    pub fn decode(word: u32) -> Result<Self> {
        let flags = (word >> 24) as u8;
        let source = (word >> 16) as u8;
        let index = word as u16;

        let kind = match flags & (FLAG_BUFFER | FLAG_TRANSITION) {
            FLAG_BUFFER => ImmKind::Buffer,
            FLAG_TRANSITION => ImmKind::Transition,
            _ => {
                return Err(EbError::Protocol(format!(
                    "immediate word {word:08x} has invalid kind flags"
                )))
            }
        };
        let response = match flags & (FLAG_RESPONSE | FLAG_NO_RESPONSE) {
            0 => ImmResponse::Unspecified,
            FLAG_RESPONSE => ImmResponse::Response,
            FLAG_NO_RESPONSE => ImmResponse::NoResponse,
            _ => {
                return Err(EbError::Protocol(format!(
                    "immediate word {word:08x} has conflicting response flags"
                )))
            }
        };
        if flags & !(FLAG_BUFFER | FLAG_TRANSITION | FLAG_RESPONSE | FLAG_NO_RESPONSE) != 0 {
            return Err(EbError::Protocol(format!(
                "immediate word {word:08x} has undefined flag bits"
            )));
        }

        Ok(Self {
            kind,
            response,
            source,
            index,
        })
    }
}
