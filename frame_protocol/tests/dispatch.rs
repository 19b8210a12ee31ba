// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use frame_protocol::dispatch::{CommandError, DispatchTable};
use frame_protocol::frame::{self, Mode};
use frame_protocol::reassembly::OwnedFrame;

const WAIT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(200);

fn owned_frame(command: u16, payload: &[u8], response_id: u32) -> OwnedFrame {
    let bytes = frame::serialize(command, payload, response_id, Mode::default()).unwrap();
    OwnedFrame::parse(&bytes, 4096).unwrap()
}

fn passthrough(bytes: &[u8]) -> Option<Vec<u8>> {
    Some(bytes.to_vec())
}

/// A handler can only send through a Sender behind a lock; mpsc senders
/// are not shareable on their own.
fn tap<T: Send + 'static>() -> (Mutex<Sender<T>>, std::sync::mpsc::Receiver<T>) {
    let (tx, rx) = channel();
    (Mutex::new(tx), rx)
}

#[test]
fn subscriber_receives_dispatched_frames() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(42, passthrough).unwrap();

    let (tx, rx) = tap();
    table
        .add_subscriber(42, move |_ctx: &(), message: &Vec<u8>| {
            tx.lock().unwrap().send(message.clone()).unwrap();
        })
        .unwrap();

    assert!(table.dispatch(1, (), owned_frame(42, &[0xDE, 0xAD], 0)));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![0xDE, 0xAD]);
}

#[test]
fn reserved_ids_are_rejected() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);

    assert_eq!(table.add_command(65501, passthrough), Err(CommandError::Reserved));
    assert_eq!(table.add_command(65535, passthrough), Err(CommandError::Reserved));

    let result = table.add_subscriber(65535, |_: &(), _: &Vec<u8>| {});
    assert_eq!(result.unwrap_err(), CommandError::Reserved);
}

#[test]
fn subscribing_before_the_command_exists_fails() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);

    let result = table.add_subscriber(7, |_: &(), _: &Vec<u8>| {});
    assert_eq!(result.unwrap_err(), CommandError::Unregistered);
}

#[test]
fn add_command_is_idempotent() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);

    table.add_command(8, passthrough).unwrap();

    let (tx, rx) = tap();
    table
        .add_subscriber(8, move |_: &(), m: &Vec<u8>| {
            tx.lock().unwrap().send(m.clone()).unwrap();
        })
        .unwrap();

    // Re-registering keeps the original entry: the decoder stays, and the
    // subscriber list survives.
    table.add_command(8, |_| None::<Vec<u8>>).unwrap();

    assert!(table.dispatch(1, (), owned_frame(8, b"kept", 0)));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"kept".to_vec());
}

/// A subscriber registered and removed before any frame arrives sees
/// nothing.
#[test]
fn removed_subscriber_gets_no_callbacks() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(9, passthrough).unwrap();

    let (tx, rx) = tap();
    let sub = table
        .add_subscriber(9, move |_: &(), m: &Vec<u8>| {
            tx.lock().unwrap().send(m.clone()).unwrap();
        })
        .unwrap();

    assert!(table.remove_subscriber(9, sub));
    assert!(!table.remove_subscriber(9, sub));

    // Removing the registration dropped the handler (and its sender), so
    // nothing can ever arrive.
    table.dispatch(1, (), owned_frame(9, b"unseen", 0));
    assert!(rx.recv_timeout(SETTLE).is_err());
}

/// A late subscriber sees only the frames dispatched after it registered.
#[test]
fn late_subscriber_sees_only_later_frames() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(10, passthrough).unwrap();

    table.dispatch(1, (), owned_frame(10, b"early-1", 0));
    table.dispatch(1, (), owned_frame(10, b"early-2", 0));

    let (tx, rx) = tap();
    table
        .add_subscriber(10, move |_: &(), m: &Vec<u8>| {
            tx.lock().unwrap().send(m.clone()).unwrap();
        })
        .unwrap();

    table.dispatch(1, (), owned_frame(10, b"late", 0));

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"late".to_vec());
    assert_eq!(rx.recv_timeout(SETTLE).unwrap_err(), RecvTimeoutError::Timeout);
}

#[test]
fn subscribers_fire_in_registration_order() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(11, passthrough).unwrap();

    // Both subscribers report through the same channel.
    let (tx, rx) = channel();
    let first = Mutex::new(tx.clone());
    let second = Mutex::new(tx);

    table
        .add_subscriber(11, move |_: &(), _: &Vec<u8>| {
            first.lock().unwrap().send(1u8).unwrap();
        })
        .unwrap();

    table
        .add_subscriber(11, move |_: &(), _: &Vec<u8>| {
            second.lock().unwrap().send(2u8).unwrap();
        })
        .unwrap();

    table.dispatch(1, (), owned_frame(11, b"x", 0));

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
}

/// Frames on one routing key are delivered in submission order.
#[test]
fn same_route_preserves_fifo() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(12, passthrough).unwrap();

    let (tx, rx) = tap();
    table
        .add_subscriber(12, move |_: &(), m: &Vec<u8>| {
            tx.lock().unwrap().send(m[0]).unwrap();
        })
        .unwrap();

    for i in 0..32u8 {
        table.dispatch(99, (), owned_frame(12, &[i], 0));
    }

    for i in 0..32u8 {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), i);
    }
}

#[test]
fn decoder_failure_drops_the_frame() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(13, |_| None::<Vec<u8>>).unwrap();

    let (tx, rx) = tap::<Vec<u8>>();
    table
        .add_subscriber(13, move |_: &(), m: &Vec<u8>| {
            tx.lock().unwrap().send(m.clone()).unwrap();
        })
        .unwrap();

    table.dispatch(1, (), owned_frame(13, b"bad", 0));
    assert_eq!(rx.recv_timeout(SETTLE).unwrap_err(), RecvTimeoutError::Timeout);
}

#[test]
fn removed_command_stops_dispatching() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(14, passthrough).unwrap();

    assert!(table.registered(14));
    assert!(table.remove_command(14));
    assert!(!table.registered(14));

    assert!(!table.dispatch(1, (), owned_frame(14, b"gone", 0)));
}

/// A panicking handler is isolated: later frames still reach the
/// subscribers.
#[test]
fn handler_panic_does_not_kill_the_worker() {
    let table: DispatchTable<()> = DispatchTable::with_capacity(16);
    table.add_command(15, passthrough).unwrap();

    let (tx, rx) = tap();
    table
        .add_subscriber(15, move |_: &(), m: &Vec<u8>| {
            if m[0] == 0xFF {
                panic!("boom");
            }
            tx.lock().unwrap().send(m[0]).unwrap();
        })
        .unwrap();

    table.dispatch(5, (), owned_frame(15, &[0xFF], 0));
    table.dispatch(5, (), owned_frame(15, &[0x01], 0));

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0x01);
}
