// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Datagram endpoints.
//!
//! The same frame format over UDP. Datagram boundaries are preserved by
//! the transport, so there is no ring and no reassembly: every datagram
//! carries one or more whole frames, and anything that fails to parse is
//! dropped with the rest of the datagram. Delivery is not guaranteed and
//! not retried; that is the transport's nature, not the runtime's job.
//!
//! Peers are keyed by sender address, with the same CONNECT/DISCONNECT/
//! PING semantics as the stream server. The receive loops run with a short
//! read timeout so a stop request is observed promptly.

use log::*;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::client::Inbound;
use crate::commands;
use crate::config::Config;
use crate::dispatch::{CommandError, DispatchTable, SubscriberId};
use crate::frame::{self, Mode, WireMessage};
use crate::peers::{Peer, PeerRegistry};
use crate::pool::ObjectPool;
use crate::reassembly::OwnedFrame;
use crate::router::{RequestHandle, Router};
use crate::state::{StateFlags, SEND};
use crate::workers;
use crate::{CommandId, DisconnectReason, PeerKey, SendError, USER_COMMAND_LIMIT};

use super::{ConnectedHook, DisconnectedHook, PeerFactory};

/// How long a blocked receive waits before re-checking the state bits.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Delivery context for datagram-server subscribers.
pub struct DatagramRemote<U> {
    key: PeerKey,
    addr: SocketAddr,
    response_id: u32,
    peer: Arc<Peer<U>>,
    socket: Arc<UdpSocket>,
    max_packet: u16,
}

impl<U> DatagramRemote<U> {
    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    pub fn peer(&self) -> &Peer<U> {
        &self.peer
    }

    /// Sends a frame back to the originating peer, preserving the inbound
    /// response id.
    pub fn reply(&self, command: CommandId, payload: &[u8]) -> Result<(), SendError> {
        if payload.len() > self.max_packet as usize {
            return Err(SendError::Invalid);
        }

        let buf = frame::serialize(command, payload, self.response_id, Mode::default())
            .map_err(|_| SendError::Invalid)?;

        match self.socket.send_to(&buf, self.addr) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("reply to {} failed: {e}", self.key);
                Err(SendError::Socket)
            }
        }
    }

    pub fn reply_value<M: WireMessage>(&self, command: CommandId, value: &M) -> Result<(), SendError> {
        let mut payload = Vec::new();
        value.encode(&mut payload);
        self.reply(command, &payload)
    }
}

struct Core<U> {
    config: Config,
    state: StateFlags,
    dispatch: DispatchTable<DatagramRemote<U>>,
    peers: PeerRegistry<U>,
    snapshots: ObjectPool<Vec<PeerKey>>,
    factory: PeerFactory<U>,
    on_connected: Mutex<Option<ConnectedHook<U>>>,
    on_disconnected: Mutex<Option<DisconnectedHook>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl<U: Send + Sync + 'static> Core<U> {
    fn disconnect_peer(&self, key: &PeerKey, reason: DisconnectReason) {
        if self.peers.remove(key).is_some() {
            info!("peer {key} disconnected ({reason})");

            let hook = *self.on_disconnected.lock().unwrap();
            if let Some(hook) = hook {
                hook(*key, reason);
            }
        }
    }
}

pub struct DatagramServer<U: Send + Sync + 'static> {
    core: Arc<Core<U>>,
}

impl<U: Send + Sync + 'static> DatagramServer<U> {
    pub fn new(factory: PeerFactory<U>) -> Self {
        Self::with_config(Config::default(), factory)
    }

    pub fn with_config(config: Config, factory: PeerFactory<U>) -> Self {
        let dispatch = DispatchTable::with_capacity(config.initial_callback_table_size);
        let peers = PeerRegistry::with_capacity(config.initial_peer_table_size);
        let snapshots = ObjectPool::new(config.pooled_buffer_count);

        Self {
            core: Arc::new(Core {
                config,
                state: StateFlags::new(),
                dispatch,
                peers,
                snapshots,
                factory,
                on_connected: Mutex::new(None),
                on_disconnected: Mutex::new(None),
                socket: Mutex::new(None),
            }),
        }
    }

    /// Binds the UDP socket and starts the receive loop. Idempotent: a
    /// second call while running returns true without rebinding.
    pub fn run(&self, port: u16) -> bool {
        if self.core.state.receiving() {
            return true;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", port)) {
            Ok(socket) => socket,
            Err(e) => {
                error!("failed to bind UDP port {port}: {e}");
                return false;
            }
        };

        if let Err(e) = socket.set_read_timeout(Some(POLL_INTERVAL)) {
            error!("failed to set read timeout: {e}");
            return false;
        }

        let socket = Arc::new(socket);
        *self.core.socket.lock().unwrap() = Some(Arc::clone(&socket));
        self.core.state.open();

        let core = Arc::clone(&self.core);
        thread::spawn(move || server_loop(core, socket));

        true
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.core.socket.lock().unwrap();
        socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn running(&self) -> bool {
        self.core.state.receiving()
    }

    /// Stops the receive loop, notifies every peer with a DISCONNECT
    /// frame, and clears the registry. Idempotent.
    pub fn stop(&self) {
        if self.core.state.close() == 0 {
            return;
        }

        let socket = self.core.socket.lock().unwrap().take();

        let mut keys = self.core.snapshots.rent();
        self.core.peers.snapshot_into(&mut keys);

        if let (Some(socket), Ok(buf)) = (
            &socket,
            frame::serialize(commands::DISCONNECT, &[], 0, Mode::default()),
        ) {
            for key in keys.iter() {
                if let PeerKey::Addr(addr) = key {
                    let _ = socket.send_to(&buf, addr);
                }
            }
        }

        for key in keys.drain(..) {
            self.core.disconnect_peer(&key, DisconnectReason::Aborted);
        }

        self.core.snapshots.put_back(keys);
    }

    pub fn send_to(
        &self,
        key: &PeerKey,
        command: CommandId,
        payload: &[u8],
        response_id: u32,
    ) -> Result<(), SendError> {
        if !self.core.state.sending() {
            return Err(SendError::Invalid);
        }

        if command > USER_COMMAND_LIMIT && command != commands::PING {
            return Err(SendError::Invalid);
        }

        if payload.len() > self.core.config.max_packet_size as usize {
            return Err(SendError::Invalid);
        }

        let PeerKey::Addr(addr) = key else {
            return Err(SendError::Invalid);
        };

        if self.core.peers.get(key).is_none() {
            return Err(SendError::Invalid);
        }

        let socket = self.core.socket.lock().unwrap().clone();
        let Some(socket) = socket else {
            return Err(SendError::Disposed);
        };

        let buf = frame::serialize(command, payload, response_id, Mode::default())
            .map_err(|_| SendError::Invalid)?;

        if let Err(e) = socket.send_to(&buf, addr) {
            warn!("send to {key} failed: {e}");
            return Err(SendError::Socket);
        }

        Ok(())
    }

    /// Serializes once and sends to every peer in the snapshot. Per-peer
    /// failures are logged and the broadcast continues.
    pub fn send_to_all(&self, command: CommandId, payload: &[u8]) {
        if !self.core.state.sending() {
            return;
        }

        let socket = self.core.socket.lock().unwrap().clone();
        let Some(socket) = socket else {
            return;
        };

        let buf = match frame::serialize(command, payload, 0, Mode::default()) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("broadcast framing failed: {e}");
                return;
            }
        };

        let mut keys = self.core.snapshots.rent();
        self.core.peers.snapshot_into(&mut keys);

        for key in keys.drain(..) {
            let PeerKey::Addr(addr) = key else {
                continue;
            };

            if let Err(e) = socket.send_to(&buf, addr) {
                warn!("broadcast to {key} failed: {e}");
            }
        }

        self.core.snapshots.put_back(keys);
    }

    pub fn peer_count(&self) -> usize {
        self.core.peers.len()
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

    pub fn add_subscriber<M, F>(&self, id: CommandId, handler: F) -> Result<SubscriberId, CommandError>
    where
        M: Send + 'static,
        F: Fn(&DatagramRemote<U>, &M) + Send + Sync + 'static,
    {
        self.core.dispatch.add_subscriber(id, handler)
    }

    pub fn remove_command(&self, id: CommandId) -> bool {
        self.core.dispatch.remove_command(id)
    }

    pub fn remove_subscriber(&self, id: CommandId, sub: SubscriberId) -> bool {
        self.core.dispatch.remove_subscriber(id, sub)
    }

    pub fn set_on_connected(&self, hook: ConnectedHook<U>) {
        *self.core.on_connected.lock().unwrap() = Some(hook);
    }

    pub fn set_on_disconnected(&self, hook: DisconnectedHook) {
        *self.core.on_disconnected.lock().unwrap() = Some(hook);
    }
}

fn server_loop<U: Send + Sync + 'static>(core: Arc<Core<U>>, socket: Arc<UdpSocket>) {
    let frame_max =
        frame::HEADER_LEN + core.config.max_packet_size as usize + frame::RESPONSE_ID_LEN;
    let mut buf = vec![0u8; frame_max.max(2048)];

    loop {
        if !core.state.receiving() {
            break;
        }

        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => handle_datagram(&core, &socket, addr, &buf[..n]),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                if core.state.receiving() {
                    warn!("datagram receive error: {e}");
                }
                continue;
            }
        }
    }

    trace!("datagram server loop exited");
}

/// One datagram may carry several back-to-back frames; parse them in
/// order and drop the remainder on the first malformed one.
fn handle_datagram<U: Send + Sync + 'static>(
    core: &Arc<Core<U>>,
    socket: &Arc<UdpSocket>,
    addr: SocketAddr,
    mut bytes: &[u8],
) {
    let key = PeerKey::Addr(addr);

    while !bytes.is_empty() {
        let frame = match OwnedFrame::parse(bytes, core.config.max_packet_size) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping malformed datagram tail from {key}: {e}");
                return;
            }
        };

        bytes = &bytes[frame.header().frame_len()..];
        handle_frame(core, socket, addr, key, frame);
    }
}

fn handle_frame<U: Send + Sync + 'static>(
    core: &Arc<Core<U>>,
    socket: &Arc<UdpSocket>,
    addr: SocketAddr,
    key: PeerKey,
    frame: OwnedFrame,
) {
    if let Some(peer) = core.peers.get(&key) {
        peer.touch();
    }

    let command = frame.command();
    match command {
        commands::PING => {
            echo(socket, addr, commands::PING, frame.payload(), frame.response_id());
        }

        commands::CONNECT => match (core.factory)(&key) {
            Some(user) => {
                let (peer, inserted) = core.peers.insert(key, user);
                if inserted {
                    info!("peer {key} connected");

                    let hook = *core.on_connected.lock().unwrap();
                    if let Some(hook) = hook {
                        hook(&peer);
                    }
                }

                echo(socket, addr, commands::CONNECT, frame.payload(), frame.response_id());
            }
            None => debug!("peer {key} rejected by factory"),
        },

        commands::DISCONNECT => core.disconnect_peer(&key, DisconnectReason::Graceful),

        id if id <= USER_COMMAND_LIMIT => {
            let Some(peer) = core.peers.get(&key) else {
                debug!("dropping frame from unregistered peer {key}");
                return;
            };

            let ctx = DatagramRemote {
                key,
                addr,
                response_id: frame.response_id(),
                peer,
                socket: Arc::clone(socket),
                max_packet: core.config.max_packet_size,
            };

            let route = workers::route_key(&key, id);
            if !core.dispatch.dispatch(route, ctx, frame) {
                debug!("no entry for command {id} from {key}; dropping frame");
            }
        }

        id => debug!("ignoring unassigned reserved command {id} from {key}"),
    }
}

fn echo(socket: &UdpSocket, addr: SocketAddr, command: CommandId, payload: &[u8], response_id: u32) {
    match frame::serialize(command, payload, response_id, Mode::default()) {
        Ok(buf) => {
            if let Err(e) = socket.send_to(&buf, addr) {
                warn!("echo to {addr} failed: {e}");
            }
        }
        Err(e) => warn!("echo framing failed: {e}"),
    }
}

struct ClientCore {
    config: Config,
    state: StateFlags,
    dispatch: DispatchTable<Inbound>,
    router: Arc<Router>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    connect_signal: Mutex<Option<SyncSender<()>>>,
    done: Mutex<Option<Receiver<()>>>,
    on_disconnected: Mutex<Option<fn(DisconnectReason)>>,
}

impl ClientCore {
    /// `notify_peer` is set only for locally initiated teardowns: a
    /// DISCONNECT datagram goes out so the server observes `Graceful`. A
    /// teardown triggered by *receiving* the server's DISCONNECT must not
    /// answer with one of its own.
    fn teardown(&self, reason: DisconnectReason, notify_peer: bool, wait_for_receiver: bool) {
        let prev = self.state.close();
        if prev == 0 {
            return;
        }

        if notify_peer && reason == DisconnectReason::Graceful && prev & SEND != 0 {
            let socket = self.socket.lock().unwrap().clone();
            if let Some(socket) = socket {
                if let Ok(buf) = frame::serialize(commands::DISCONNECT, &[], 0, Mode::default()) {
                    let _ = socket.send(&buf);
                }
            }
        }

        self.socket.lock().unwrap().take();

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

        debug!("datagram client disconnected ({reason})");
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

        let socket = self.socket.lock().unwrap().clone();
        let Some(socket) = socket else {
            return Err(SendError::Disposed);
        };

        if let Err(e) = socket.send(&buf) {
            warn!("datagram send failed: {e}");
            return Err(SendError::Socket);
        }

        Ok(())
    }
}

pub struct DatagramClient {
    core: Arc<ClientCore>,
}

impl Default for DatagramClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramClient {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let dispatch = DispatchTable::with_capacity(config.initial_callback_table_size);

        Self {
            core: Arc::new(ClientCore {
                config,
                state: StateFlags::new(),
                dispatch,
                router: Arc::new(Router::new()),
                socket: Mutex::new(None),
                connect_signal: Mutex::new(None),
                done: Mutex::new(None),
                on_disconnected: Mutex::new(None),
            }),
        }
    }

    /// Binds an ephemeral local socket, aims it at the server, and runs
    /// the CONNECT handshake. True once acknowledged. Keep in mind the
    /// handshake datagrams themselves can be lost; a false return may just
    /// mean that.
    pub fn connect(&self, host: &str, port: u16) -> bool {
        if self.core.state.receiving() {
            return true;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("failed to bind local socket: {e}");
                return false;
            }
        };

        let target = match (host, port).to_socket_addrs().map(|mut a| a.next()) {
            Ok(Some(addr)) => addr,
            _ => {
                warn!("cannot resolve {host}:{port}");
                return false;
            }
        };

        if let Err(e) = socket.connect(target) {
            warn!("connect to {target} failed: {e}");
            return false;
        }

        if let Err(e) = socket.set_read_timeout(Some(POLL_INTERVAL)) {
            warn!("failed to set read timeout: {e}");
            return false;
        }

        let socket = Arc::new(socket);
        let key = PeerKey::Addr(target);

        let (signal_tx, signal_rx) = mpsc::sync_channel(1);
        let (done_tx, done_rx) = mpsc::channel();

        *self.core.socket.lock().unwrap() = Some(Arc::clone(&socket));
        *self.core.connect_signal.lock().unwrap() = Some(signal_tx);
        *self.core.done.lock().unwrap() = Some(done_rx);
        self.core.state.open();

        let core = Arc::clone(&self.core);
        thread::spawn(move || {
            // The loop's reason already reflects what the peer did; no
            // datagram goes back out from here.
            let reason = client_loop(&core, key, socket);
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

    /// Idempotent teardown. A graceful disconnect announces itself to the
    /// server with a DISCONNECT datagram first.
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.core.teardown(reason, true, true);
    }

    pub fn send(&self, command: CommandId, payload: &[u8], response_id: u32) -> Result<(), SendError> {
        if command > USER_COMMAND_LIMIT && command != commands::PING {
            return Err(SendError::Invalid);
        }

        self.core.send_frame(command, payload, response_id)
    }

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

    pub fn add_subscriber<M, F>(&self, id: CommandId, handler: F) -> Result<SubscriberId, CommandError>
    where
        M: Send + 'static,
        F: Fn(&Inbound, &M) + Send + Sync + 'static,
    {
        self.core.dispatch.add_subscriber(id, handler)
    }

    pub fn remove_command(&self, id: CommandId) -> bool {
        self.core.dispatch.remove_command(id)
    }

    pub fn remove_subscriber(&self, id: CommandId, sub: SubscriberId) -> bool {
        self.core.dispatch.remove_subscriber(id, sub)
    }

    pub fn set_on_disconnected(&self, hook: fn(DisconnectReason)) {
        *self.core.on_disconnected.lock().unwrap() = Some(hook);
    }
}

fn client_loop(core: &Arc<ClientCore>, key: PeerKey, socket: Arc<UdpSocket>) -> DisconnectReason {
    let frame_max =
        frame::HEADER_LEN + core.config.max_packet_size as usize + frame::RESPONSE_ID_LEN;
    let mut buf = vec![0u8; frame_max.max(2048)];

    loop {
        if !core.state.receiving() {
            return DisconnectReason::Aborted;
        }

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                if core.state.receiving() {
                    warn!("datagram receive error: {e}");
                    return DisconnectReason::Error;
                }
                return DisconnectReason::Aborted;
            }
        };

        let mut bytes = &buf[..n];
        while !bytes.is_empty() {
            let frame = match OwnedFrame::parse(bytes, core.config.max_packet_size) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("dropping malformed datagram tail: {e}");
                    break;
                }
            };

            bytes = &bytes[frame.header().frame_len()..];

            if let Some(reason) = handle_client_frame(core, key, &socket, frame) {
                return reason;
            }
        }
    }
}

fn handle_client_frame(
    core: &Arc<ClientCore>,
    key: PeerKey,
    socket: &UdpSocket,
    frame: OwnedFrame,
) -> Option<DisconnectReason> {
    if frame.response_id() != 0 && core.router.complete(frame.response_id(), frame.payload().to_vec())
    {
        return None;
    }

    let command = frame.command();
    match command {
        commands::PING => {
            match frame::serialize(commands::PING, frame.payload(), frame.response_id(), Mode::default())
            {
                Ok(buf) => {
                    if let Err(e) = socket.send(&buf) {
                        warn!("ping echo failed: {e}");
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

        commands::DISCONNECT => return Some(DisconnectReason::Graceful),

        id if id <= USER_COMMAND_LIMIT => {
            let route = workers::route_key(&key, id);
            let ctx = Inbound::new(frame.response_id());

            if !core.dispatch.dispatch(route, ctx, frame) {
                debug!("no entry for command {id}; dropping frame");
            }
        }

        id => debug!("ignoring unassigned reserved command {id}"),
    }

    None
}
