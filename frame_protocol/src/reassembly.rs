// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Frame reassembly over the byte ring.
//!
//! Stream transports deliver fragments with arbitrary boundaries; this
//! state machine turns those fragments back into whole frames. A valid
//! header never starts with a high-bit byte and always carries the checksum
//! marker six bytes in, so the seek state can discard impossible positions
//! with two one-byte peeks before the header checksum does the real
//! filtering. Corruption costs one byte of progress at a time; it never
//! costs the connection.

use log::*;

use crate::frame::{self, Frame, FrameError, Header, HEADER_LEN, RESPONSE_ID_LEN};
use crate::pool::{self, PoolBuf};
use crate::ring::RingBuffer;
use crate::CommandId;

/// A whole frame in a buffer rented from the pool. Dropping it returns the
/// buffer; the payload accessor borrows from it. This is the currency the
/// receive paths hand to dispatch.
#[derive(Debug)]
pub struct OwnedFrame {
    header: Header,
    response_id: u32,
    buf: PoolBuf,
}

impl OwnedFrame {
    /// Validates and copies one whole frame out of a contiguous buffer (a
    /// datagram, typically).
    pub fn parse(bytes: &[u8], max_packet: u16) -> Result<OwnedFrame, FrameError> {
        let Frame {
            header,
            response_id,
            ..
        } = frame::deserialize(bytes, max_packet)?;

        let mut buf = pool::rent(header.frame_len());
        buf.copy_from_slice(&bytes[..header.frame_len()]);

        Ok(OwnedFrame {
            header,
            response_id,
            buf,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn command(&self) -> CommandId {
        self.header.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..HEADER_LEN + self.header.length as usize]
    }

    /// Zero for fire-and-forget frames.
    pub fn response_id(&self) -> u32 {
        self.response_id
    }
}

#[derive(Clone, Copy)]
enum State {
    /// The ring may hold garbage; hunting for a plausible frame start.
    Seek,

    /// Aligned on a candidate header; waiting for all seven bytes and a
    /// passing checksum.
    ReadHeader,

    /// Header accepted; waiting for the whole frame.
    ReadBody(Header),
}

/// Single-consumer frame extractor. The transport writes raw bytes in with
/// [`push`](Reassembler::push); the owner drains whole frames out with
/// [`next_frame`](Reassembler::next_frame) on the same task.
pub struct Reassembler {
    ring: RingBuffer,
    state: State,
    max_packet: u16,
}

impl Reassembler {
    /// The ring is sized to hold two maximal frames so that one frame can
    /// be parsed while the next is landing.
    pub fn new(max_packet: u16) -> Self {
        let frame_max = HEADER_LEN + max_packet as usize + RESPONSE_ID_LEN;

        Self {
            ring: RingBuffer::new(frame_max * 2),
            state: State::Seek,
            max_packet,
        }
    }

    /// Feeds received bytes in. A short write means the ring overflowed
    /// and bytes were dropped; whatever frame they belonged to can never
    /// complete, so parsing falls back to seeking.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let written = self.ring.write(bytes);

        if written < bytes.len() {
            warn!(
                "ring overflow: dropped {} of {} bytes, resynchronising",
                bytes.len() - written,
                bytes.len()
            );
            self.state = State::Seek;
        }

        written
    }

    /// Extracts the next whole frame, or None when more bytes are needed.
    /// Callers drain in a loop after every push.
    pub fn next_frame(&mut self) -> Option<OwnedFrame> {
        loop {
            match self.state {
                State::Seek => {
                    if !self.seek() {
                        return None;
                    }
                    self.state = State::ReadHeader;
                }

                State::ReadHeader => {
                    let raw = self.ring.peek_header(0)?;

                    match Header::parse(&raw, self.max_packet) {
                        Ok(header) => self.state = State::ReadBody(header),
                        Err(e) => {
                            trace!("rejected header ({e}), skipping one byte");
                            self.ring.skip(1);
                            self.state = State::Seek;
                        }
                    }
                }

                State::ReadBody(header) => {
                    let need = header.frame_len();
                    if self.ring.len() < need {
                        return None;
                    }

                    let mut buf = pool::rent(need);
                    self.ring.read(&mut buf, 0);

                    let response_id = if header.has_response {
                        let at = HEADER_LEN + header.length as usize;
                        u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
                    } else {
                        0
                    };

                    self.state = State::ReadHeader;

                    return Some(OwnedFrame {
                        header,
                        response_id,
                        buf,
                    });
                }
            }
        }
    }

    /// Discards bytes that cannot start a header. True once the tail rests
    /// on a candidate; false when the ring ran out of bytes to judge.
    fn seek(&mut self) -> bool {
        loop {
            let Some(first) = self.ring.peek_byte(0) else {
                return false;
            };

            if first & 0x80 != 0 {
                self.ring.skip(1);
                continue;
            }

            match self.ring.peek_byte(HEADER_LEN - 1) {
                // A header start needs the checksum marker bit set in its
                // final byte.
                Some(marker) if marker & 0x80 == 0 => {
                    self.ring.skip(1);
                }
                Some(_) => return true,
                // Plausible start, not enough bytes to judge yet.
                None => return false,
            }
        }
    }

    /// Bytes currently buffered and unparsed.
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Drops all buffered bytes and starts seeking from scratch.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.state = State::Seek;
    }
}
