// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Process-wide buffer pooling.
//!
//! Every send and every reassembled frame lives in a buffer rented from
//! here. Buffers are bucketed by power-of-two size class with a cap per
//! bucket; renting from an empty bucket allocates fresh storage, so a rent
//! can never observe a slot that was not explicitly returned. The
//! [`PoolBuf`] guard returns its storage when dropped, which makes
//! "returned exactly once, on every path" hold by construction.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

/// Smallest bucket is 64 bytes; largest holds a maximal frame
/// (7 + 65535 + 4 rounds up to 128 KiB).
const MIN_SHIFT: u32 = 6;
const MAX_SHIFT: u32 = 17;
const CLASS_COUNT: usize = (MAX_SHIFT - MIN_SHIFT + 1) as usize;

/// At most this many buffers are retained per bucket; surplus returns are
/// simply freed.
const BUCKET_CAP: usize = 32;

struct BufferPool {
    buckets: Mutex<[Vec<Vec<u8>>; CLASS_COUNT]>,
    outstanding: AtomicUsize,
}

fn global() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool {
        buckets: Mutex::new(std::array::from_fn(|_| Vec::new())),
        outstanding: AtomicUsize::new(0),
    })
}

/// Index of the smallest class that can hold `size` bytes, or None when the
/// request exceeds the largest class.
fn class_of(size: usize) -> Option<usize> {
    let shift = usize::BITS - size.max(1).next_power_of_two().leading_zeros() - 1;
    let shift = shift.max(MIN_SHIFT);

    if shift > MAX_SHIFT {
        return None;
    }

    Some((shift - MIN_SHIFT) as usize)
}

/// Rents a buffer of exactly `size` readable bytes (zeroed on first use,
/// stale contents after reuse — callers overwrite before reading). Sizes
/// beyond the largest class are served by a plain allocation that is freed
/// rather than pooled on return.
pub fn rent(size: usize) -> PoolBuf {
    let pool = global();
    pool.outstanding.fetch_add(1, Ordering::Relaxed);

    let mut data = match class_of(size) {
        Some(class) => {
            let mut buckets = pool.buckets.lock().unwrap();
            buckets[class]
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(1usize << (class as u32 + MIN_SHIFT)))
        }
        None => Vec::with_capacity(size),
    };

    data.resize(size, 0);
    PoolBuf { data }
}

/// Rented minus returned. Balanced pools read zero here once all guards
/// have dropped; tests lean on this.
pub fn outstanding() -> usize {
    global().outstanding.load(Ordering::Relaxed)
}

fn give_back(mut data: Vec<u8>) {
    let pool = global();
    pool.outstanding.fetch_sub(1, Ordering::Relaxed);

    // Only exact class-sized capacities go back in a bucket; anything else
    // was an oversize one-off.
    let capacity = data.capacity();
    if !capacity.is_power_of_two() || capacity < (1 << MIN_SHIFT) || capacity > (1 << MAX_SHIFT) {
        return;
    }

    let class = (capacity.trailing_zeros() - MIN_SHIFT) as usize;
    data.clear();

    let mut buckets = pool.buckets.lock().unwrap();
    if buckets[class].len() < BUCKET_CAP {
        buckets[class].push(data);
    }
}

/// A byte buffer on loan from the pool. Dereferences to its byte contents;
/// dropping it returns the storage.
#[derive(Debug)]
pub struct PoolBuf {
    data: Vec<u8>,
}

impl PoolBuf {
    /// Shortens the readable region. Handy when a buffer was rented at a
    /// worst-case size and the real length is only known afterwards.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        give_back(std::mem::take(&mut self.data));
    }
}

/// A small pool of per-operation objects. The slots are populated at
/// construction, so a rent never sees anything but a returned or freshly
/// made object; renting from an empty pool constructs a new one.
pub struct ObjectPool<T> {
    slots: Mutex<Vec<T>>,
    cap: usize,
}

impl<T: Default> ObjectPool<T> {
    pub fn new(cap: usize) -> Self {
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, T::default);

        Self {
            slots: Mutex::new(slots),
            cap,
        }
    }

    pub fn rent(&self) -> T {
        self.slots.lock().unwrap().pop().unwrap_or_default()
    }

    /// Returns an object to the pool. Objects beyond the cap are dropped.
    /// Callers reset any state they care about before returning.
    pub fn put_back(&self, value: T) {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() < self.cap {
            slots.push(value);
        }
    }

    pub fn available(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
