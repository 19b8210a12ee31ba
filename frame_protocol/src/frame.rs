// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The wire format.
//!
//! A frame is a fixed 7-byte header, a payload, and an optional trailing
//! 4-byte response id:
//!
//! ```text
//! byte 0      flags: bits 0..2 encrypt mode, bits 3..5 compress mode,
//!             bit 6 response, bit 7 reserved (always 0)
//! bytes 1..4  little-endian u32, high half command id, low half length
//! bytes 5..6  little-endian u16 checksum over bytes 0..=4, bit 15 set
//! bytes 7..   `length` payload bytes, then a big-endian u32 response id
//!             iff the response flag is set
//! ```
//!
//! The checksum keeps bit 15 forced on, the same way a record mark keeps
//! its high bit: byte 6 of a valid header always has its top bit set while
//! byte 0 never does, which gives the reassembler two one-byte tests to
//! discard impossible frame starts cheaply.

use crate::pool::{self, PoolBuf};
use crate::CommandId;

use std::fmt;

pub const HEADER_LEN: usize = 7;
pub const RESPONSE_ID_LEN: usize = 4;

const FLAG_RESPONSE: u8 = 0x40;
const FLAG_RESERVED: u8 = 0x80;
const MODE_MASK: u8 = 0x07;
const CHECKSUM_MARKER: u16 = 0x8000;

/// Ways a frame can fail to parse or be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the header (or the header's claim) requires.
    Truncated,

    /// The stored checksum does not match the header bytes.
    BadChecksum,

    /// The claimed payload length exceeds the configured maximum.
    Oversize,

    /// The reserved flag bit was set.
    ReservedBits,

    /// An encrypt or compress mode outside 0..=7 was requested.
    BadMode,
}

impl std::error::Error for FrameError {}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Truncated => "frame truncated",
                Self::BadChecksum => "checksum mismatch",
                Self::Oversize => "payload length over the packet limit",
                Self::ReservedBits => "reserved flag bit set",
                Self::BadMode => "mode value out of range",
            }
        )
    }
}

/// Transform mode bits carried in the header. The runtime only routes
/// these; the transforms themselves are external.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mode {
    pub encrypt: u8,
    pub compress: u8,
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub encrypt_mode: u8,
    pub compress_mode: u8,
    pub has_response: bool,
    pub command: CommandId,
    pub length: u16,
    pub checksum: u16,
}

impl Header {
    /// Validates and parses raw header bytes. `max_packet` bounds the
    /// claimed payload length.
    pub fn parse(raw: &[u8; HEADER_LEN], max_packet: u16) -> Result<Header, FrameError> {
        let flags = raw[0];

        if flags & FLAG_RESERVED != 0 {
            return Err(FrameError::ReservedBits);
        }

        let stored = u16::from_le_bytes([raw[5], raw[6]]);
        if stored != checksum(&raw[..5]) {
            return Err(FrameError::BadChecksum);
        }

        let packed = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let length = (packed & 0xFFFF) as u16;

        if length > max_packet {
            return Err(FrameError::Oversize);
        }

        Ok(Header {
            encrypt_mode: flags & MODE_MASK,
            compress_mode: (flags >> 3) & MODE_MASK,
            has_response: flags & FLAG_RESPONSE != 0,
            command: (packed >> 16) as CommandId,
            length,
            checksum: stored,
        })
    }

    /// Total on-wire size of the frame this header describes.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN
            + self.length as usize
            + if self.has_response { RESPONSE_ID_LEN } else { 0 }
    }
}

/// Fletcher-16 over the first five header bytes, with the marker bit
/// forced. Deterministic and stateless, so any observer can verify it.
pub fn checksum(prefix: &[u8]) -> u16 {
    let mut a: u16 = 0;
    let mut b: u16 = 0;

    for &byte in prefix {
        a = (a + byte as u16) % 255;
        b = (b + a) % 255;
    }

    (b << 8 | a) | CHECKSUM_MARKER
}

/// A frame borrowed out of a contiguous byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: Header,
    pub payload: &'a [u8],

    /// Zero when the response flag was clear.
    pub response_id: u32,
}

/// Builds the wire form of a frame in a buffer rented from the pool. The
/// response flag is set iff `response_id` is non-zero. The caller's guard
/// returns the buffer when it drops, after the send completes or fails.
pub fn serialize(
    command: CommandId,
    payload: &[u8],
    response_id: u32,
    mode: Mode,
) -> Result<PoolBuf, FrameError> {
    if mode.encrypt > MODE_MASK || mode.compress > MODE_MASK {
        return Err(FrameError::BadMode);
    }

    let length = u16::try_from(payload.len()).map_err(|_| FrameError::Oversize)?;

    let total = HEADER_LEN
        + payload.len()
        + if response_id != 0 { RESPONSE_ID_LEN } else { 0 };
    let mut buf = pool::rent(total);

    let mut flags = mode.encrypt | mode.compress << 3;
    if response_id != 0 {
        flags |= FLAG_RESPONSE;
    }

    buf[0] = flags;

    let packed = (command as u32) << 16 | length as u32;
    buf[1..5].copy_from_slice(&packed.to_le_bytes());

    let sum = checksum(&buf[..5]);
    buf[5..7].copy_from_slice(&sum.to_le_bytes());

    buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);

    if response_id != 0 {
        buf[HEADER_LEN + payload.len()..].copy_from_slice(&response_id.to_be_bytes());
    }

    Ok(buf)
}

/// Parses one whole frame out of `bytes`. The exact inverse of
/// [`serialize`]: header validation, then the payload slice, then the
/// trailing response id when the response flag is set. Trailing bytes
/// beyond the frame are ignored.
pub fn deserialize(bytes: &[u8], max_packet: u16) -> Result<Frame<'_>, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }

    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&bytes[..HEADER_LEN]);

    let header = Header::parse(&raw, max_packet)?;

    if bytes.len() < header.frame_len() {
        return Err(FrameError::Truncated);
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + header.length as usize];

    let response_id = if header.has_response {
        let at = HEADER_LEN + header.length as usize;
        u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    } else {
        0
    };

    Ok(Frame {
        header,
        payload,
        response_id,
    })
}

/// Byte encoding for a user message type. The runtime never reflects over
/// values; each message type brings its own encoder and decoder pair.
pub trait WireMessage: Sized {
    fn encode(&self, out: &mut Vec<u8>);

    /// Returns None when the bytes do not form a valid message; the frame
    /// is then dropped without reaching subscribers.
    fn decode(bytes: &[u8]) -> Option<Self>;
}

impl WireMessage for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(bytes.to_vec())
    }
}

impl WireMessage for String {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}
