// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Process-wide worker pool for handler fan-out.
//!
//! The receive paths hand decoded frames here so subscriber callbacks never
//! run on a transport thread. Each worker drains its own queue; a job's
//! routing key picks the worker, so jobs sharing a key (one peer, one
//! command) run in submission order while unrelated keys spread across the
//! pool.

use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;

use log::*;

use crate::{CommandId, PeerKey};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    lanes: Vec<Mutex<Sender<Job>>>,
}

fn global() -> &'static WorkerPool {
    static POOL: OnceLock<WorkerPool> = OnceLock::new();

    POOL.get_or_init(|| {
        let count = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .min(8);

        let lanes = (0..count)
            .map(|i| {
                let (tx, rx) = channel::<Job>();

                thread::Builder::new()
                    .name(format!("frame-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            // A panicking handler must not take the worker
                            // down with it.
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!("subscriber handler panicked; worker continuing");
                            }
                        }
                    })
                    .expect("failed to spawn worker thread");

                Mutex::new(tx)
            })
            .collect();

        WorkerPool { lanes }
    })
}

/// Routing key for a frame: stable per (peer, command) pair.
pub fn route_key(peer: &PeerKey, command: CommandId) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    peer.hash(&mut hasher);
    command.hash(&mut hasher);
    hasher.finish()
}

/// Queues a job on the worker that owns `key`. Jobs with equal keys run in
/// the order they were submitted.
pub fn submit(key: u64, job: impl FnOnce() + Send + 'static) {
    let pool = global();
    let lane = (key % pool.lanes.len() as u64) as usize;

    let sender = pool.lanes[lane].lock().unwrap();
    if sender.send(Box::new(job)).is_err() {
        error!("worker lane {lane} unavailable; dropping job");
    }
}
