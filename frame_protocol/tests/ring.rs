// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use frame_protocol::ring::RingBuffer;

#[test]
fn capacity_rounds_up_to_power_of_two() {
    assert_eq!(RingBuffer::new(10).capacity(), 16);
    assert_eq!(RingBuffer::new(16).capacity(), 16);
    assert_eq!(RingBuffer::new(17).capacity(), 32);
}

#[test]
fn count_tracks_writes_and_reads() {
    let ring = RingBuffer::new(64);

    assert_eq!(ring.write(&[1, 2, 3, 4, 5]), 5);
    assert_eq!(ring.len(), 5);
    assert_eq!(ring.free(), 59);

    let mut out = [0u8; 2];
    assert!(ring.read(&mut out, 0));
    assert_eq!(out, [1, 2]);
    assert_eq!(ring.len(), 3);

    assert_eq!(ring.skip(2), 2);
    assert_eq!(ring.len(), 1);

    let mut out = [0u8; 1];
    assert!(ring.read(&mut out, 0));
    assert_eq!(out, [5]);
    assert_eq!(ring.len(), 0);
}

/// Reading past a skip prefix consumes the prefix too.
#[test]
fn read_consumes_the_skip_prefix() {
    let ring = RingBuffer::new(16);
    ring.write(&[10, 11, 12, 13, 14]);

    let mut out = [0u8; 2];
    assert!(ring.read(&mut out, 2));
    assert_eq!(out, [12, 13]);

    // 2 skipped + 2 read leaves exactly one byte.
    assert_eq!(ring.len(), 1);
    assert_eq!(ring.peek_byte(0), Some(14));
}

#[test]
fn short_reads_consume_nothing() {
    let ring = RingBuffer::new(16);
    ring.write(&[1, 2, 3]);

    let mut out = [0u8; 4];
    assert!(!ring.read(&mut out, 0));
    assert!(!ring.read(&mut [0u8; 2], 2));
    assert_eq!(ring.len(), 3);
}

#[test]
fn peek_does_not_consume() {
    let ring = RingBuffer::new(16);
    ring.write(&[9, 8, 7]);

    let mut out = [0u8; 2];
    assert!(ring.peek(&mut out, 1));
    assert_eq!(out, [8, 7]);
    assert_eq!(ring.len(), 3);

    assert_eq!(ring.peek_byte(0), Some(9));
    assert_eq!(ring.peek_byte(2), Some(7));
    assert_eq!(ring.peek_byte(3), None);
}

/// Data wrapping the physical end of the buffer comes back intact; this is
/// the two-segment copy path on both the write and read side.
#[test]
fn wrap_around_copies_both_segments() {
    let ring = RingBuffer::new(16);

    ring.write(&[0u8; 12]);
    assert_eq!(ring.skip(12), 12);

    // Starts at offset 12, wraps after 4 bytes.
    let data: Vec<u8> = (1..=10).collect();
    assert_eq!(ring.write(&data), 10);

    let mut out = [0u8; 10];
    assert!(ring.read(&mut out, 0));
    assert_eq!(&out[..], &data[..]);
    assert_eq!(ring.len(), 0);
}

#[test]
fn wrapped_read_with_skip() {
    let ring = RingBuffer::new(16);

    ring.write(&[0u8; 14]);
    ring.skip(14);

    let data: Vec<u8> = (1..=8).collect();
    ring.write(&data);

    let mut out = [0u8; 4];
    assert!(ring.read(&mut out, 3));
    assert_eq!(out, [4, 5, 6, 7]);
    assert_eq!(ring.len(), 1);
}

/// Overflow drops the excess instead of overwriting.
#[test]
fn overflowing_write_is_truncated() {
    let ring = RingBuffer::new(16);

    let data: Vec<u8> = (0..20).collect();
    assert_eq!(ring.write(&data), 16);
    assert_eq!(ring.len(), 16);
    assert_eq!(ring.free(), 0);
    assert_eq!(ring.write(&[1]), 0);

    let mut out = [0u8; 16];
    assert!(ring.read(&mut out, 0));
    assert_eq!(&out[..], &data[..16]);
}

#[test]
fn peek_header_needs_seven_bytes() {
    let ring = RingBuffer::new(32);

    ring.write(&[1, 2, 3, 4, 5, 6]);
    assert!(ring.peek_header(0).is_none());

    ring.write(&[7]);
    assert_eq!(ring.peek_header(0), Some([1, 2, 3, 4, 5, 6, 7]));

    // Still there: peeking never consumes.
    assert_eq!(ring.len(), 7);
    assert!(ring.peek_header(1).is_none());
}

#[test]
fn skip_until_lands_on_the_match() {
    let ring = RingBuffer::new(32);
    ring.write(&[1, 2, 3, 0xAB, 4, 5]);

    assert!(ring.skip_until(0, 0xAB));
    assert_eq!(ring.peek_byte(0), Some(0xAB));
    assert_eq!(ring.len(), 3);
}

#[test]
fn skip_until_respects_the_offset() {
    let ring = RingBuffer::new(32);
    ring.write(&[0xAB, 1, 2, 0xAB, 3]);

    assert!(ring.skip_until(1, 0xAB));
    assert_eq!(ring.peek_byte(0), Some(0xAB));
    assert_eq!(ring.len(), 2);
}

#[test]
fn skip_until_miss_drains_the_ring() {
    let ring = RingBuffer::new(32);
    ring.write(&[1, 2, 3, 4]);

    assert!(!ring.skip_until(0, 0xAB));
    assert_eq!(ring.len(), 0);
}

#[test]
fn clear_empties_the_ring() {
    let ring = RingBuffer::new(32);
    ring.write(&[1, 2, 3]);

    ring.clear();
    assert!(ring.is_empty());
    assert_eq!(ring.peek_byte(0), None);
}
