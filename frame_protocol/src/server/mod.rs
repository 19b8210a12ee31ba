// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The stream server.
//!
//! One accept loop, one receive loop per connection. A connection becomes a
//! peer when its CONNECT handshake passes the application's factory; from
//! then on its user frames flow through the dispatch table to subscribers
//! on the worker pool. Broadcasts iterate a snapshot of the registry so a
//! slow socket never blocks registration.

use log::*;

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::commands;
use crate::config::Config;
use crate::dispatch::{CommandError, DispatchTable, SubscriberId};
use crate::frame::{self, Mode, WireMessage};
use crate::peers::{Peer, PeerRegistry};
use crate::pool::ObjectPool;
use crate::reassembly::{OwnedFrame, Reassembler};
use crate::state::StateFlags;
use crate::transport::{Link, Listener, Stream};
use crate::workers;
use crate::{CommandId, DisconnectReason, PeerKey, SendError, USER_COMMAND_LIMIT};

pub mod datagram;

/// Decides whether a connecting peer is admitted, and builds its per-peer
/// state. Returning None rejects the connection.
pub type PeerFactory<U> = fn(&PeerKey) -> Option<U>;

pub type ConnectedHook<U> = fn(&Peer<U>);
pub type DisconnectedHook = fn(PeerKey, DisconnectReason);

/// Delivery context handed to server-side subscribers: who sent the frame,
/// the response id it carried, and a direct way to answer.
pub struct Remote<U> {
    key: PeerKey,
    response_id: u32,
    peer: Arc<Peer<U>>,
    link: Link,
    max_packet: u16,
}

impl<U> Remote<U> {
    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// The inbound frame's response id; replies carry it back so the
    /// sender's router can correlate.
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

        self.link.send(&buf).map_err(|e| {
            warn!("reply to {} failed: {e}", self.key);
            SendError::Socket
        })
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
    dispatch: DispatchTable<Remote<U>>,
    peers: PeerRegistry<U>,
    links: Mutex<HashMap<PeerKey, Link>>,
    snapshots: ObjectPool<Vec<PeerKey>>,
    factory: PeerFactory<U>,
    on_connected: Mutex<Option<ConnectedHook<U>>>,
    on_disconnected: Mutex<Option<DisconnectedHook>>,
    stopper: Mutex<Option<Box<dyn Fn() + Send>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<U: Send + Sync + 'static> Core<U> {
    /// Removes the peer and its link. The disconnected hook fires only for
    /// the caller that actually removed the registry entry, so concurrent
    /// teardown paths cannot double-report.
    fn disconnect_peer(&self, key: &PeerKey, reason: DisconnectReason) {
        let link = self.links.lock().unwrap().remove(key);
        if let Some(link) = link {
            link.close();
        }

        if self.peers.remove(key).is_some() {
            info!("peer {key} disconnected ({reason})");

            let hook = *self.on_disconnected.lock().unwrap();
            if let Some(hook) = hook {
                hook(*key, reason);
            }
        }
    }

    fn link_for(&self, key: &PeerKey) -> Option<Link> {
        self.links.lock().unwrap().get(key).cloned()
    }
}

pub struct Server<U: Send + Sync + 'static> {
    core: Arc<Core<U>>,
}

impl<U: Send + Sync + 'static> Server<U> {
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
                links: Mutex::new(HashMap::new()),
                snapshots,
                factory,
                on_connected: Mutex::new(None),
                on_disconnected: Mutex::new(None),
                stopper: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Binds a TCP listener and starts accepting. Idempotent: a second
    /// call while running returns true without rebinding.
    pub fn run(&self, port: u16) -> bool {
        if self.core.state.receiving() {
            return true;
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to bind port {port}: {e}");
                return false;
            }
        };

        *self.core.local_addr.lock().unwrap() = listener.local_addr().ok();
        self.run_on(listener)
    }

    /// Starts accepting on an already-bound listener. This is also the
    /// seam for non-TCP listeners.
    pub fn run_on<S: Stream, L: Listener<S>>(&self, listener: L) -> bool {
        if self.core.state.receiving() {
            return true;
        }

        self.core.state.open();

        let listener = Arc::new(listener);
        let stopper: Box<dyn Fn() + Send> = {
            let listener = Arc::clone(&listener);
            Box::new(move || {
                let _ = listener.shutdown();
            })
        };
        *self.core.stopper.lock().unwrap() = Some(stopper);

        let core = Arc::clone(&self.core);
        thread::spawn(move || accept_loop(core, listener));

        true
    }

    /// The actual bound address; useful when `run` was given port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.lock().unwrap()
    }

    pub fn running(&self) -> bool {
        self.core.state.receiving()
    }

    /// Stops accepting, notifies every peer with a DISCONNECT frame, and
    /// tears the registry down. Idempotent.
    pub fn stop(&self) {
        if self.core.state.close() == 0 {
            return;
        }

        let stopper = self.core.stopper.lock().unwrap().take();
        if let Some(stopper) = stopper {
            stopper();
        }

        let mut keys = self.core.snapshots.rent();
        self.core.peers.snapshot_into(&mut keys);

        if let Ok(buf) = frame::serialize(commands::DISCONNECT, &[], 0, Mode::default()) {
            for key in keys.iter() {
                if let Some(link) = self.core.link_for(key) {
                    let _ = link.send(&buf);
                }
            }
        }

        for key in keys.drain(..) {
            self.core.disconnect_peer(&key, DisconnectReason::Aborted);
        }

        self.core.snapshots.put_back(keys);

        // Connections that never completed a handshake still hold links.
        let leftover: Vec<Link> = {
            let mut links = self.core.links.lock().unwrap();
            links.drain().map(|(_, link)| link).collect()
        };
        for link in leftover {
            link.close();
        }
    }

    /// Sends one frame to one peer.
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

        if self.core.peers.get(key).is_none() {
            return Err(SendError::Invalid);
        }

        let Some(link) = self.core.link_for(key) else {
            return Err(SendError::Disposed);
        };

        let buf = frame::serialize(command, payload, response_id, Mode::default())
            .map_err(|_| SendError::Invalid)?;

        if let Err(e) = link.send(&buf) {
            warn!("send to {key} failed: {e}");
            self.core.disconnect_peer(key, DisconnectReason::Error);
            return Err(SendError::Socket);
        }

        Ok(())
    }

    /// Typed send through the message's own encoder.
    pub fn send_value_to<M: WireMessage>(
        &self,
        key: &PeerKey,
        command: CommandId,
        value: &M,
        response_id: u32,
    ) -> Result<(), SendError> {
        let mut payload = Vec::new();
        value.encode(&mut payload);
        self.send_to(key, command, &payload, response_id)
    }

    /// Sends one frame to every peer present when the snapshot was taken.
    /// The frame is serialized once; per-peer failures are logged, the
    /// failing peer is disconnected with `Error`, and the broadcast
    /// continues.
    pub fn send_to_all(&self, command: CommandId, payload: &[u8]) {
        if !self.core.state.sending() {
            return;
        }

        if command > USER_COMMAND_LIMIT {
            warn!("refusing broadcast of reserved command {command}");
            return;
        }

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
            let Some(link) = self.core.link_for(&key) else {
                continue;
            };

            if let Err(e) = link.send(&buf) {
                warn!("broadcast to {key} failed: {e}");
                self.core.disconnect_peer(&key, DisconnectReason::Error);
            }
        }

        self.core.snapshots.put_back(keys);
    }

    pub fn send_value_to_all<M: WireMessage>(&self, command: CommandId, value: &M) {
        let mut payload = Vec::new();
        value.encode(&mut payload);
        self.send_to_all(command, &payload);
    }

    pub fn peer_count(&self) -> usize {
        self.core.peers.len()
    }

    pub fn peer(&self, key: &PeerKey) -> Option<Arc<Peer<U>>> {
        self.core.peers.get(key)
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
        F: Fn(&Remote<U>, &M) + Send + Sync + 'static,
    {
        self.core.dispatch.add_subscriber(id, handler)
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

fn accept_loop<U: Send + Sync + 'static, S: Stream, L: Listener<S>>(core: Arc<Core<U>>, listener: Arc<L>) {
    loop {
        match listener.accept() {
            Ok(stream) => {
                if !core.state.receiving() {
                    break;
                }

                if let Err(e) = spawn_connection(&core, stream) {
                    warn!("failed to start connection: {e}");
                }
            }
            Err(e) => {
                if !core.state.receiving() {
                    break;
                }
                warn!("accept error: {e}");
            }
        }
    }

    trace!("accept loop exited");
}

fn spawn_connection<U: Send + Sync + 'static, S: Stream>(
    core: &Arc<Core<U>>,
    stream: S,
) -> io::Result<()> {
    let key = stream.peer_key()?;
    let reader = stream.try_clone()?;
    let link = Link::from_stream(stream)?;

    core.links.lock().unwrap().insert(key, link.clone());
    debug!("accepted connection from {key}");

    let core = Arc::clone(core);
    thread::spawn(move || {
        let reason = connection_loop(&core, key, reader, &link);
        core.disconnect_peer(&key, reason);
    });

    Ok(())
}

enum Flow {
    Continue,
    Closed(DisconnectReason),
}

fn connection_loop<U: Send + Sync + 'static, S: Stream>(
    core: &Arc<Core<U>>,
    key: PeerKey,
    mut stream: S,
    link: &Link,
) -> DisconnectReason {
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
            match handle_frame(core, key, link, frame) {
                Flow::Continue => {}
                Flow::Closed(reason) => return reason,
            }
        }
    }
}

fn handle_frame<U: Send + Sync + 'static>(
    core: &Arc<Core<U>>,
    key: PeerKey,
    link: &Link,
    frame: OwnedFrame,
) -> Flow {
    if let Some(peer) = core.peers.get(&key) {
        peer.touch();
    }

    let command = frame.command();
    match command {
        commands::PING => {
            match frame::serialize(commands::PING, frame.payload(), frame.response_id(), Mode::default())
            {
                Ok(buf) => {
                    if let Err(e) = link.send(&buf) {
                        warn!("ping echo to {key} failed: {e}");
                        return Flow::Closed(DisconnectReason::Error);
                    }
                }
                Err(e) => warn!("ping echo framing failed: {e}"),
            }
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

                match frame::serialize(
                    commands::CONNECT,
                    frame.payload(),
                    frame.response_id(),
                    Mode::default(),
                ) {
                    Ok(buf) => {
                        if let Err(e) = link.send(&buf) {
                            warn!("connect ack to {key} failed: {e}");
                            return Flow::Closed(DisconnectReason::Error);
                        }
                    }
                    Err(e) => warn!("connect ack framing failed: {e}"),
                }
            }
            None => {
                debug!("peer {key} rejected by factory");
                return Flow::Closed(DisconnectReason::Unspecified);
            }
        },

        commands::DISCONNECT => return Flow::Closed(DisconnectReason::Graceful),

        id if id <= USER_COMMAND_LIMIT => {
            let Some(peer) = core.peers.get(&key) else {
                debug!("dropping frame from unregistered peer {key}");
                return Flow::Continue;
            };

            let ctx = Remote {
                key,
                response_id: frame.response_id(),
                peer,
                link: link.clone(),
                max_packet: core.config.max_packet_size,
            };

            let route = workers::route_key(&key, id);
            if !core.dispatch.dispatch(route, ctx, frame) {
                debug!("no entry for command {id} from {key}; dropping frame");
            }
        }

        id => debug!("ignoring unassigned reserved command {id} from {key}"),
    }

    Flow::Continue
}
