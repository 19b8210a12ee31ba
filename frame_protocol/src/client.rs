// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The stream client.
//!
//! A client owns one connection: a receive thread that feeds the ring and
//! reassembler, a dispatch table for pushed frames, and a response router
//! that correlates request/response pairs by response id. All sends are
//! synchronous; request waiters block with a bounded timeout.

use log::*;

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::commands;
use crate::config::Config;
use crate::dispatch::{CommandError, DispatchTable, SubscriberId};
use crate::frame::{self, Mode, WireMessage};
use crate::reassembly::{OwnedFrame, Reassembler};
use crate::router::{RequestHandle, Router};
use crate::state::{StateFlags, SEND};
use crate::transport::{Link, Stream};
use crate::workers;
use crate::{CommandId, DisconnectReason, PeerKey, SendError, USER_COMMAND_LIMIT};

/// Delivery context handed to client-side subscribers: the response id the
/// frame carried (zero for fire-and-forget pushes).
pub struct Inbound {
    response_id: u32,
}

impl Inbound {
    pub(crate) fn new(response_id: u32) -> Self {
        Self { response_id }
    }

    pub fn response_id(&self) -> u32 {
        self.response_id
    }
}

struct Core {
    config: Config,
    state: StateFlags,
    dispatch: DispatchTable<Inbound>,
    router: Arc<Router>,
    link: Mutex<Option<Link>>,
    connect_signal: Mutex<Option<SyncSender<()>>>,
    done: Mutex<Option<Receiver<()>>>,
    on_disconnected: Mutex<Option<fn(DisconnectReason)>>,
}

impl Core {
    /// The one teardown path. The state swap makes it idempotent: exactly
    /// one caller observes live bits and runs the body, so the
    /// disconnected hook fires at most once per connection.
    ///
    /// `notify_peer` is set only for locally initiated teardowns: a
    /// DISCONNECT frame goes out so the remote observes `Graceful` rather
    /// than a dead socket. A teardown triggered by *receiving* the peer's
    /// DISCONNECT must not answer with one of its own.
    fn teardown(&self, reason: DisconnectReason, notify_peer: bool, wait_for_receiver: bool) {
        let prev = self.state.close();
        if prev == 0 {
            return;
        }

        if notify_peer && reason == DisconnectReason::Graceful && prev & SEND != 0 {
            let link = self.link.lock().unwrap().clone();
            if let Some(link) = link {
                if let Ok(buf) = frame::serialize(commands::DISCONNECT, &[], 0, Mode::default()) {
                    let _ = link.send(&buf);
                }
            }
        }

        if let Some(link) = self.link.lock().unwrap().take() {
            link.close();
        }

        if wait_for_receiver {
            let done = self.done.lock().unwrap().take();
            if let Some(done) = done {
                if done.recv_timeout(self.config.close_timeout).is_err() {
                    warn!("receive loop did not exit within the close timeout");
                }
            }
        }

        self.router.drain();

        let hook = *self.on_disconnected.lock().unwrap();
        if let Some(hook) = hook {
            hook(reason);
        }

        debug!("disconnected ({reason})");
    }

    fn send_frame(&self, command: CommandId, payload: &[u8], response_id: u32) -> Result<(), SendError> {
        if !self.state.sending() {
            return Err(SendError::Invalid);
        }

        if payload.len() > self.config.max_packet_size as usize {
            return Err(SendError::Invalid);
        }

        let buf = frame::serialize(command, payload, response_id, Mode::default())
            .map_err(|_| SendError::Invalid)?;

        let link = self.link.lock().unwrap().clone();
        let Some(link) = link else {
            return Err(SendError::Disposed);
        };

        if let Err(e) = link.send(&buf) {
            warn!("send failed: {e}");
            self.teardown(DisconnectReason::Error, false, false);
            return Err(SendError::Socket);
        }

        Ok(())
    }
}

pub struct Client {
    core: Arc<Core>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let dispatch = DispatchTable::with_capacity(config.initial_callback_table_size);

        Self {
            core: Arc::new(Core {
                config,
                state: StateFlags::new(),
                dispatch,
                router: Arc::new(Router::new()),
                link: Mutex::new(None),
                connect_signal: Mutex::new(None),
                done: Mutex::new(None),
                on_disconnected: Mutex::new(None),
            }),
        }
    }

    /// Connects over TCP and runs the CONNECT handshake. True once the
    /// server has acknowledged the handshake; calling while already
    /// connected is a no-op that returns true.
    pub fn connect(&self, host: &str, port: u16) -> bool {
        match TcpStream::connect((host, port)) {
            Ok(stream) => self.connect_stream(stream),
            Err(e) => {
                warn!("connect to {host}:{port} failed: {e}");
                false
            }
        }
    }

    /// Runs the connection over an already-established stream. This is the
    /// seam the pipe-based tests use.
    pub fn connect_stream<S: Stream>(&self, stream: S) -> bool {
        if self.core.state.receiving() {
            return true;
        }

        let key = match stream.peer_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("no peer key for stream: {e}");
                return false;
            }
        };

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                warn!("failed to split stream: {e}");
                return false;
            }
        };

        let link = match Link::from_stream(stream) {
            Ok(link) => link,
            Err(e) => {
                warn!("failed to split stream: {e}");
                return false;
            }
        };

        let (signal_tx, signal_rx) = mpsc::sync_channel(1);
        let (done_tx, done_rx) = mpsc::channel();

        *self.core.link.lock().unwrap() = Some(link.clone());
        *self.core.connect_signal.lock().unwrap() = Some(signal_tx);
        *self.core.done.lock().unwrap() = Some(done_rx);
        self.core.state.open();

        let core = Arc::clone(&self.core);
        thread::spawn(move || {
            // The loop's reason already reflects what the peer did; no
            // frame goes back out from here.
            let reason = receive_loop(&core, key, reader, link);
            core.teardown(reason, false, false);
            let _ = done_tx.send(());
        });

        if self.core.send_frame(commands::CONNECT, &[], 0).is_err() {
            self.core.teardown(DisconnectReason::Error, false, true);
            return false;
        }

        match signal_rx.recv_timeout(self.core.config.close_timeout) {
            Ok(()) => {
                debug!("connected to {key}");
                true
            }
            Err(_) => {
                warn!("no CONNECT acknowledgement from {key}");
                self.core.teardown(DisconnectReason::Unspecified, false, true);
                false
            }
        }
    }

    pub fn connected(&self) -> bool {
        self.core.state.receiving()
    }

    /// Tears the connection down: clears the state bits, closes the
    /// transport with a bounded wait for the receive loop, and drains
    /// pending waiters with `Aborted`. Idempotent. A graceful disconnect
    /// announces itself to the server with a DISCONNECT frame first.
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.core.teardown(reason, true, true);
    }

    /// Fire-and-forget (or correlated, when `response_id` is non-zero)
    /// send of a user command. PING is also allowed so callers can probe
    /// the connection by hand.
    pub fn send(&self, command: CommandId, payload: &[u8], response_id: u32) -> Result<(), SendError> {
        if command > USER_COMMAND_LIMIT && command != commands::PING {
            return Err(SendError::Invalid);
        }

        self.core.send_frame(command, payload, response_id)
    }

    /// Typed send through the message's own encoder.
    pub fn send_value<M: WireMessage>(
        &self,
        command: CommandId,
        value: &M,
        response_id: u32,
    ) -> Result<(), SendError> {
        let mut payload = Vec::new();
        value.encode(&mut payload);
        self.send(command, &payload, response_id)
    }

    /// Sends a request under a fresh non-zero response id and returns the
    /// handle that waits for the matching response.
    pub fn send_request(&self, command: CommandId, payload: &[u8]) -> Result<RequestHandle, SendError> {
        if command > USER_COMMAND_LIMIT && command != commands::PING {
            return Err(SendError::Invalid);
        }

        let id = self.core.router.fresh_id();
        let rx = self.core.router.register(id);

        if let Err(e) = self.core.send_frame(command, payload, id) {
            self.core.router.forget(id);
            return Err(e);
        }

        Ok(RequestHandle::new(
            id,
            rx,
            Arc::clone(&self.core.router),
            self.core.config.response_timeout,
        ))
    }

    /// PING round trip: the server echoes the payload, which completes the
    /// returned handle.
    pub fn ping(&self, payload: &[u8]) -> Result<RequestHandle, SendError> {
        self.send_request(commands::PING, payload)
    }

    pub fn add_command<M: Send + 'static>(
        &self,
        id: CommandId,
        decode: fn(&[u8]) -> Option<M>,
    ) -> Result<(), CommandError> {
        self.core.dispatch.add_command(id, decode)
    }

    pub fn add_wire_command<M: WireMessage + Send + 'static>(
        &self,
        id: CommandId,
    ) -> Result<(), CommandError> {
        self.core.dispatch.add_wire_command::<M>(id)
    }

    pub fn remove_command(&self, id: CommandId) -> bool {
        self.core.dispatch.remove_command(id)
    }

    pub fn add_subscriber<M, F>(&self, id: CommandId, handler: F) -> Result<SubscriberId, CommandError>
    where
        M: Send + 'static,
        F: Fn(&Inbound, &M) + Send + Sync + 'static,
    {
        self.core.dispatch.add_subscriber(id, handler)
    }

    pub fn remove_subscriber(&self, id: CommandId, sub: SubscriberId) -> bool {
        self.core.dispatch.remove_subscriber(id, sub)
    }

    pub fn set_on_disconnected(&self, hook: fn(DisconnectReason)) {
        *self.core.on_disconnected.lock().unwrap() = Some(hook);
    }
}

enum Flow {
    Continue,
    Closed,
}

fn receive_loop<S: Stream>(core: &Arc<Core>, key: PeerKey, mut stream: S, link: Link) -> DisconnectReason {
    let mut reassembler = Reassembler::new(core.config.max_packet_size);
    let mut chunk = [0u8; 4096];

    loop {
        if !core.state.receiving() {
            return DisconnectReason::Aborted;
        }

        let n = match stream.read(&mut chunk) {
            Ok(0) => return DisconnectReason::Error,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if core.state.receiving() {
                    warn!("read error from {key}: {e}");
                    return DisconnectReason::Error;
                }
                return DisconnectReason::Aborted;
            }
        };

        reassembler.push(&chunk[..n]);

        while let Some(frame) = reassembler.next_frame() {
            match handle_frame(core, key, &link, frame) {
                Flow::Continue => {}
                Flow::Closed => return DisconnectReason::Graceful,
            }
        }
    }
}

fn handle_frame(core: &Arc<Core>, key: PeerKey, link: &Link, frame: OwnedFrame) -> Flow {
    // Correlated responses complete their waiter and stop there. A frame
    // whose id has no waiter (the request was never ours, or the waiter
    // already completed) falls through to normal dispatch.
    if frame.response_id() != 0 && core.router.complete(frame.response_id(), frame.payload().to_vec())
    {
        return Flow::Continue;
    }

    let command = frame.command();
    match command {
        commands::PING => {
            match frame::serialize(commands::PING, frame.payload(), frame.response_id(), Mode::default())
            {
                Ok(buf) => {
                    if let Err(e) = link.send(&buf) {
                        warn!("ping echo to {key} failed: {e}");
                    }
                }
                Err(e) => warn!("ping echo framing failed: {e}"),
            }
        }

        commands::CONNECT => {
            let signal = core.connect_signal.lock().unwrap().take();
            if let Some(signal) = signal {
                let _ = signal.send(());
            }
        }

        commands::DISCONNECT => return Flow::Closed,

        id if id <= USER_COMMAND_LIMIT => {
            let route = workers::route_key(&key, id);
            let ctx = Inbound {
                response_id: frame.response_id(),
            };

            if !core.dispatch.dispatch(route, ctx, frame) {
                debug!("no entry for command {id}; dropping frame");
            }
        }

        id => debug!("ignoring unassigned reserved command {id}"),
    }

    Flow::Continue
}
