// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use frame_protocol::frame::{self, FrameError, Mode, HEADER_LEN};

#[test]
fn serialize_deserialize_round_trip() {
    let payload = [0xDE, 0xAD, 0xBE, 0xEF];
    let buf = frame::serialize(42, &payload, 7, Mode::default()).unwrap();

    assert_eq!(buf.len(), HEADER_LEN + payload.len() + 4);

    let frame = frame::deserialize(&buf, 4096).unwrap();
    assert_eq!(frame.header.command, 42);
    assert_eq!(frame.header.length, 4);
    assert!(frame.header.has_response);
    assert_eq!(frame.payload, &payload);
    assert_eq!(frame.response_id, 7);
}

#[test]
fn fire_and_forget_has_no_trailer() {
    let buf = frame::serialize(9, b"abc", 0, Mode::default()).unwrap();

    assert_eq!(buf.len(), HEADER_LEN + 3);

    let frame = frame::deserialize(&buf, 4096).unwrap();
    assert!(!frame.header.has_response);
    assert_eq!(frame.response_id, 0);
    assert_eq!(frame.payload, b"abc");
}

#[test]
fn empty_payload_round_trip() {
    let buf = frame::serialize(0, &[], 0, Mode::default()).unwrap();
    assert_eq!(buf.len(), HEADER_LEN);

    let frame = frame::deserialize(&buf, 4096).unwrap();
    assert_eq!(frame.header.command, 0);
    assert_eq!(frame.payload.len(), 0);
}

/// The resynchronisation marker: a valid header never starts with a
/// high-bit byte, and its checksum high byte always carries one.
#[test]
fn header_marker_bits() {
    let buf = frame::serialize(65500, &[0xFF; 32], 0xFFFF_FFFF, Mode::default()).unwrap();

    assert_eq!(buf[0] & 0x80, 0);
    assert_eq!(buf[6] & 0x80, 0x80);
}

#[test]
fn mode_bits_round_trip() {
    let mode = Mode {
        encrypt: 3,
        compress: 5,
    };
    let buf = frame::serialize(1, b"x", 0, mode).unwrap();

    let frame = frame::deserialize(&buf, 4096).unwrap();
    assert_eq!(frame.header.encrypt_mode, 3);
    assert_eq!(frame.header.compress_mode, 5);
}

#[test]
fn mode_out_of_range_is_rejected() {
    let mode = Mode {
        encrypt: 8,
        compress: 0,
    };
    assert_eq!(frame::serialize(1, b"x", 0, mode).unwrap_err(), FrameError::BadMode);
}

#[test]
fn corrupted_header_is_rejected() {
    let mut buf = frame::serialize(7, b"hello", 0, Mode::default()).unwrap();
    buf[1] ^= 0xFF;

    assert_eq!(frame::deserialize(&buf, 4096), Err(FrameError::BadChecksum));
}

#[test]
fn reserved_bit_is_rejected() {
    let mut buf = frame::serialize(7, b"hello", 0, Mode::default()).unwrap();
    buf[0] |= 0x80;

    assert_eq!(frame::deserialize(&buf, 4096), Err(FrameError::ReservedBits));
}

#[test]
fn oversize_claim_is_rejected() {
    let buf = frame::serialize(7, &[0u8; 100], 0, Mode::default()).unwrap();

    assert_eq!(frame::deserialize(&buf, 50), Err(FrameError::Oversize));
}

#[test]
fn truncated_frames_are_rejected() {
    let buf = frame::serialize(7, b"hello", 3, Mode::default()).unwrap();

    assert_eq!(frame::deserialize(&buf[..5], 4096), Err(FrameError::Truncated));
    assert_eq!(
        frame::deserialize(&buf[..buf.len() - 1], 4096),
        Err(FrameError::Truncated)
    );
}

#[test]
fn trailing_bytes_are_ignored() {
    let mut bytes = frame::serialize(7, b"ab", 0, Mode::default()).unwrap().to_vec();
    bytes.extend_from_slice(b"junk");

    let frame = frame::deserialize(&bytes, 4096).unwrap();
    assert_eq!(frame.payload, b"ab");
}

#[test]
fn checksum_is_deterministic() {
    let prefix = [0x40, 0x02, 0x00, 0x2A, 0x00];
    assert_eq!(frame::checksum(&prefix), frame::checksum(&prefix));
    assert_ne!(frame::checksum(&prefix) & 0x8000, 0);
}
