// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::atomic::{AtomicU8, Ordering};

pub const RECEIVE: u8 = 0x01;
pub const SEND: u8 = 0x02;

/// One byte of connection state. Receive loops run while [`RECEIVE`] is set;
/// sends are rejected while [`SEND`] is clear. Disposing clears both bits,
/// and the caller that observes the transition owns the teardown, which is
/// what makes disconnects idempotent.
#[derive(Debug, Default)]
pub struct StateFlags {
    bits: AtomicU8,
}

impl StateFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the connection live for both directions.
    pub fn open(&self) {
        self.bits.store(RECEIVE | SEND, Ordering::Release);
    }

    /// Clears both bits. Returns the bits that were set, so exactly one
    /// caller sees a non-zero value and runs the teardown.
    pub fn close(&self) -> u8 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    pub fn receiving(&self) -> bool {
        self.bits.load(Ordering::Acquire) & RECEIVE != 0
    }

    pub fn sending(&self) -> bool {
        self.bits.load(Ordering::Acquire) & SEND != 0
    }
}
