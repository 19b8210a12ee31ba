// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use frame_protocol::frame::{self, Mode};
use frame_protocol::reassembly::Reassembler;

fn wire_frame(command: u16, payload: &[u8], response_id: u32) -> Vec<u8> {
    frame::serialize(command, payload, response_id, Mode::default())
        .unwrap()
        .to_vec()
}

#[test]
fn whole_frame_in_one_push() {
    let mut rsm = Reassembler::new(4096);

    rsm.push(&wire_frame(42, &[0xDE, 0xAD], 7));

    let frame = rsm.next_frame().expect("one frame");
    assert_eq!(frame.command(), 42);
    assert_eq!(frame.payload(), &[0xDE, 0xAD]);
    assert_eq!(frame.response_id(), 7);

    assert!(rsm.next_frame().is_none());
    assert_eq!(rsm.buffered(), 0);
}

/// A 14-byte frame delivered as 3 + 2 + 9 bytes across three pushes comes
/// out as exactly one frame, after the last push.
#[test]
fn fragmented_delivery_reassembles() {
    let bytes = wire_frame(3, &[1, 2, 3, 4, 5, 6, 7], 0);
    assert_eq!(bytes.len(), 14);

    let mut rsm = Reassembler::new(4096);

    rsm.push(&bytes[..3]);
    assert!(rsm.next_frame().is_none());

    rsm.push(&bytes[3..5]);
    assert!(rsm.next_frame().is_none());

    rsm.push(&bytes[5..]);
    let frame = rsm.next_frame().expect("one frame");
    assert_eq!(frame.command(), 3);
    assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7]);

    assert!(rsm.next_frame().is_none());
}

#[test]
fn byte_at_a_time_delivery() {
    let bytes = wire_frame(800, b"trickle", 0xABCD);
    let mut rsm = Reassembler::new(4096);

    let mut emitted = 0;
    for &b in &bytes {
        rsm.push(&[b]);
        while let Some(frame) = rsm.next_frame() {
            assert_eq!(frame.payload(), b"trickle");
            assert_eq!(frame.response_id(), 0xABCD);
            emitted += 1;
        }
    }

    assert_eq!(emitted, 1);
}

/// Garbage before a valid frame is skipped; the frame still comes out.
#[test]
fn garbage_prefix_is_dropped() {
    let mut rsm = Reassembler::new(4096);

    rsm.push(&[0x11, 0x80, 0xFF, 0x03, 0x7F]);
    rsm.push(&wire_frame(42, &[0xDE, 0xAD], 7));

    let frame = rsm.next_frame().expect("one frame");
    assert_eq!(frame.command(), 42);
    assert_eq!(frame.payload(), &[0xDE, 0xAD]);

    assert!(rsm.next_frame().is_none());
    assert_eq!(rsm.buffered(), 0);
}

/// Valid frames interleaved with garbage come out whole and in order.
#[test]
fn interleaved_garbage_preserves_frame_order() {
    let mut rsm = Reassembler::new(4096);

    rsm.push(&wire_frame(1, b"first", 0));
    rsm.push(&[0xAA; 9]);
    rsm.push(&wire_frame(2, b"second", 5));
    rsm.push(&[0x00, 0x01, 0x02]);
    rsm.push(&wire_frame(3, b"third", 0));

    let mut seen = Vec::new();
    while let Some(frame) = rsm.next_frame() {
        seen.push((frame.command(), frame.payload().to_vec(), frame.response_id()));
    }

    assert_eq!(
        seen,
        vec![
            (1, b"first".to_vec(), 0),
            (2, b"second".to_vec(), 5),
            (3, b"third".to_vec(), 0),
        ]
    );
}

/// A frame claiming a length over the limit is corruption, not a frame;
/// the reassembler walks past it and recovers the next valid one.
#[test]
fn oversize_claim_resynchronises() {
    let oversized = wire_frame(9, &[0xAA; 100], 0);

    let mut rsm = Reassembler::new(64);
    rsm.push(&oversized[..32]);
    rsm.push(&wire_frame(10, b"ok", 0));

    let frame = rsm.next_frame().expect("the valid frame");
    assert_eq!(frame.command(), 10);
    assert_eq!(frame.payload(), b"ok");
}

/// Ring overflow drops bytes; the reassembler abandons the partial frame
/// and picks up the next valid header.
#[test]
fn overflow_resynchronises() {
    // max_packet 16 gives a small ring (64 bytes).
    let mut rsm = Reassembler::new(16);

    let accepted = rsm.push(&[0xAA; 100]);
    assert!(accepted < 100);

    // All of it is garbage; seeking drains the ring.
    assert!(rsm.next_frame().is_none());

    rsm.push(&wire_frame(7, b"alive", 0));
    let frame = rsm.next_frame().expect("frame after resync");
    assert_eq!(frame.command(), 7);
    assert_eq!(frame.payload(), b"alive");
}

/// A frame split across an overflow can never complete; its delivered
/// prefix must not poison the frames that follow.
#[test]
fn truncated_frame_tail_is_discarded() {
    let mut rsm = Reassembler::new(16);
    let capacity = 64;

    // Fill the ring exactly, then overflow with the start of a frame.
    rsm.push(&vec![0xAA; capacity]);
    let lost = rsm.push(&wire_frame(5, b"lost", 0));
    assert_eq!(lost, 0);

    // Drain the garbage, then deliver a fresh frame.
    assert!(rsm.next_frame().is_none());
    rsm.push(&wire_frame(6, b"kept", 0));

    let frame = rsm.next_frame().expect("the fresh frame");
    assert_eq!(frame.command(), 6);
    assert_eq!(frame.payload(), b"kept");
}

#[test]
fn clear_resets_everything() {
    let mut rsm = Reassembler::new(4096);
    let bytes = wire_frame(1, b"partial", 0);

    rsm.push(&bytes[..6]);
    rsm.clear();
    assert_eq!(rsm.buffered(), 0);

    rsm.push(&wire_frame(2, b"fresh", 0));
    let frame = rsm.next_frame().expect("one frame");
    assert_eq!(frame.command(), 2);
}

#[test]
fn back_to_back_frames_in_one_push() {
    let mut bytes = wire_frame(1, b"a", 0);
    bytes.extend_from_slice(&wire_frame(2, b"bb", 3));
    bytes.extend_from_slice(&wire_frame(3, b"ccc", 0));

    let mut rsm = Reassembler::new(4096);
    rsm.push(&bytes);

    let commands: Vec<u16> = std::iter::from_fn(|| rsm.next_frame())
        .map(|f| f.command())
        .collect();
    assert_eq!(commands, vec![1, 2, 3]);
}
