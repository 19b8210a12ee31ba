// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The command dispatch table.
//!
//! Maps a command id to its payload decoder and an ordered list of
//! subscribers. Registration and removal may race against frames being
//! dispatched; one short lock guards the table and every entry's list, and
//! the dispatch path only holds it long enough to copy the decoder and the
//! subscriber snapshot. Handlers always run outside the lock, on the
//! worker pool.
//!
//! The table is generic over a context type so each endpoint can hand its
//! subscribers what they need to reply: the server passes the originating
//! peer, the client passes the inbound response id.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::*;

use crate::frame::WireMessage;
use crate::reassembly::OwnedFrame;
use crate::workers;
use crate::{CommandId, USER_COMMAND_LIMIT};

/// Registration errors, surfaced synchronously to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// The id is above [`USER_COMMAND_LIMIT`] and belongs to the runtime.
    Reserved,

    /// No command entry exists for the id; `add_command` first.
    Unregistered,
}

impl std::error::Error for CommandError {}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Reserved => "command id is reserved for the runtime",
                Self::Unregistered => "command id has no registered entry",
            }
        )
    }
}

/// Identifies one subscriber registration, for removal. Closures have no
/// identity of their own, so registration hands one out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type BoxedMessage = Box<dyn Any + Send>;
type Decoder = Arc<dyn Fn(&[u8]) -> Option<BoxedMessage> + Send + Sync>;
type Handler<C> = Arc<dyn Fn(&C, &(dyn Any + Send)) + Send + Sync>;

struct Entry<C> {
    decoder: Decoder,
    subscribers: Vec<(SubscriberId, Handler<C>)>,
}

pub struct DispatchTable<C> {
    entries: Mutex<HashMap<CommandId, Entry<C>>>,
    next_subscriber: AtomicU64,
}

impl<C: Send + Sync + 'static> DispatchTable<C> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Registers a command with its payload decoder and an empty subscriber
    /// list. Idempotent: a second registration keeps the existing entry.
    pub fn add_command<M: Send + 'static>(
        &self,
        id: CommandId,
        decode: fn(&[u8]) -> Option<M>,
    ) -> Result<(), CommandError> {
        if id > USER_COMMAND_LIMIT {
            return Err(CommandError::Reserved);
        }

        let mut entries = self.entries.lock().unwrap();

        entries.entry(id).or_insert_with(|| Entry {
            decoder: Arc::new(move |bytes| {
                decode(bytes).map(|m| Box::new(m) as BoxedMessage)
            }),
            subscribers: Vec::new(),
        });

        Ok(())
    }

    /// Registers a command whose payload type brings its own codec.
    pub fn add_wire_command<M: WireMessage + Send + 'static>(
        &self,
        id: CommandId,
    ) -> Result<(), CommandError> {
        self.add_command(id, M::decode)
    }

    /// Removes the entry and releases its subscribers. Returns whether an
    /// entry existed.
    pub fn remove_command(&self, id: CommandId) -> bool {
        self.entries.lock().unwrap().remove(&id).is_some()
    }

    pub fn registered(&self, id: CommandId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    /// Appends a subscriber to the command's list. Subscribers for one
    /// command fire in registration order.
    pub fn add_subscriber<M, F>(&self, id: CommandId, handler: F) -> Result<SubscriberId, CommandError>
    where
        M: Send + 'static,
        F: Fn(&C, &M) + Send + Sync + 'static,
    {
        if id > USER_COMMAND_LIMIT {
            return Err(CommandError::Reserved);
        }

        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(CommandError::Unregistered)?;

        let sub = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));

        let wrapped: Handler<C> = Arc::new(move |ctx: &C, message: &(dyn Any + Send)| {
            if let Some(message) = message.downcast_ref::<M>() {
                handler(ctx, message);
            }
        });
        entry.subscribers.push((sub, wrapped));

        Ok(sub)
    }

    /// Removes one subscriber registration. Returns whether it was found.
    pub fn remove_subscriber(&self, id: CommandId, sub: SubscriberId) -> bool {
        let mut entries = self.entries.lock().unwrap();

        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };

        let before = entry.subscribers.len();
        entry.subscribers.retain(|(existing, _)| *existing != sub);
        before != entry.subscribers.len()
    }

    /// Hands a frame to the command's subscribers on the worker pool.
    /// `route` keeps per-(peer, command) delivery in order. Returns false
    /// when the command has no entry, so callers can log the drop.
    pub fn dispatch(&self, route: u64, ctx: C, frame: OwnedFrame) -> bool {
        let (decoder, handlers) = {
            let entries = self.entries.lock().unwrap();

            let Some(entry) = entries.get(&frame.command()) else {
                return false;
            };

            (
                Arc::clone(&entry.decoder),
                entry
                    .subscribers
                    .iter()
                    .map(|(_, h)| Arc::clone(h))
                    .collect::<Vec<_>>(),
            )
        };

        workers::submit(route, move || {
            let Some(message) = decoder(frame.payload()) else {
                debug!("decoder rejected payload for command {}", frame.command());
                return;
            };

            for handler in &handlers {
                handler(&ctx, message.as_ref());
            }
        });

        true
    }
}
