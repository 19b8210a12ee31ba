// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server-side peer registry.
//!
//! One entry per connected peer, inserted when a CONNECT handshake is
//! accepted and removed on disconnect. A single short lock covers insert,
//! remove, lookup, and snapshot; broadcast iteration happens outside it on
//! a copied key set, so a slow socket never blocks registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::PeerKey;

/// Per-peer state. `U` is whatever the application attaches to a peer via
/// the server's factory.
pub struct Peer<U> {
    key: PeerKey,
    last_received: Mutex<Instant>,
    pub user: U,
}

impl<U> Peer<U> {
    fn new(key: PeerKey, user: U) -> Self {
        Self {
            key,
            last_received: Mutex::new(Instant::now()),
            user,
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// Monotonic instant of the last frame seen from this peer.
    pub fn last_received(&self) -> Instant {
        *self.last_received.lock().unwrap()
    }

    pub(crate) fn touch(&self) {
        *self.last_received.lock().unwrap() = Instant::now();
    }
}

pub struct PeerRegistry<U> {
    peers: Mutex<HashMap<PeerKey, Arc<Peer<U>>>>,
}

impl<U> PeerRegistry<U> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Inserts a peer, or returns the existing entry for the key: while a
    /// peer is registered there is exactly one state for it, and a repeated
    /// CONNECT does not replace it.
    pub fn insert(&self, key: PeerKey, user: U) -> (Arc<Peer<U>>, bool) {
        let mut peers = self.peers.lock().unwrap();

        match peers.get(&key) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                let peer = Arc::new(Peer::new(key, user));
                peers.insert(key, Arc::clone(&peer));
                (peer, true)
            }
        }
    }

    pub fn remove(&self, key: &PeerKey) -> Option<Arc<Peer<U>>> {
        self.peers.lock().unwrap().remove(key)
    }

    pub fn get(&self, key: &PeerKey) -> Option<Arc<Peer<U>>> {
        self.peers.lock().unwrap().get(key).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current key set into `out` under the registry lock. The
    /// caller iterates after the lock is released.
    pub fn snapshot_into(&self, out: &mut Vec<PeerKey>) {
        let peers = self.peers.lock().unwrap();
        out.extend(peers.keys().copied());
    }
}
