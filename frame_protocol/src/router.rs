// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Response correlation.
//!
//! A client that sends a request under a non-zero response id registers a
//! waiter here; the matching response completes it. Waiters are removed on
//! completion, on timeout, and on disconnect, so a response id never
//! completes twice — the duplicate falls through to ordinary dispatch and,
//! with no entry there, gets dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ResponseError;

/// Maps outstanding response ids to their waiters. Ids come from a
/// monotonic counter; zero is reserved for fire-and-forget and never
/// handed out.
pub(crate) struct Router {
    waiters: Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>,
    next_id: AtomicU32,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub(crate) fn fresh_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub(crate) fn register(&self, id: u32) -> Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        self.waiters.lock().unwrap().insert(id, tx);
        rx
    }

    /// Completes and removes the waiter for `id`. False when no waiter is
    /// registered (unknown or duplicate response).
    pub(crate) fn complete(&self, id: u32, payload: Vec<u8>) -> bool {
        let Some(tx) = self.waiters.lock().unwrap().remove(&id) else {
            return false;
        };

        // A waiter that gave up between removal and send just drops the
        // payload.
        let _ = tx.send(payload);
        true
    }

    pub(crate) fn forget(&self, id: u32) {
        self.waiters.lock().unwrap().remove(&id);
    }

    /// Drops every pending waiter; their receivers observe the hangup and
    /// report `Aborted`.
    pub(crate) fn drain(&self) {
        self.waiters.lock().unwrap().clear();
    }
}

/// Waits for the response to one request. Letting the handle drop without
/// waiting abandons the request.
pub struct RequestHandle {
    id: u32,
    rx: Receiver<Vec<u8>>,
    router: Arc<Router>,
    timeout: Duration,
}

impl RequestHandle {
    pub(crate) fn new(id: u32, rx: Receiver<Vec<u8>>, router: Arc<Router>, timeout: Duration) -> Self {
        Self {
            id,
            rx,
            router,
            timeout,
        }
    }

    pub fn response_id(&self) -> u32 {
        self.id
    }

    /// Blocks until the response arrives, the configured response timeout
    /// elapses, or the connection goes down. The connection stays up
    /// across a timeout; only the waiter dies.
    pub fn wait(self) -> Result<Vec<u8>, ResponseError> {
        let timeout = self.timeout;
        self.wait_for(timeout)
    }

    pub fn wait_for(self, timeout: Duration) -> Result<Vec<u8>, ResponseError> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(payload),
            Err(RecvTimeoutError::Timeout) => {
                self.router.forget(self.id);
                Err(ResponseError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(ResponseError::Aborted),
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.router.forget(self.id);
    }
}
