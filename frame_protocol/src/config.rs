// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

/// Runtime options recognized by the endpoints. Every field has a default;
/// construct with `Config::default()` and override what you need.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on a frame's payload length. Frames claiming more are
    /// treated as corruption on the receive path and rejected on the send
    /// path.
    pub max_packet_size: u16,

    /// Bounded wait on transport shutdown during a disconnect.
    pub close_timeout: Duration,

    /// How long a request waiter may sit before it is completed with
    /// `ResponseError::Timeout`.
    pub response_timeout: Duration,

    /// Initial capacity of the command dispatch table.
    pub initial_callback_table_size: usize,

    /// Initial capacity of the server-side peer registry.
    pub initial_peer_table_size: usize,

    /// Number of pre-populated slots in the per-operation object pool.
    pub pooled_buffer_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: 4096,
            close_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            initial_callback_table_size: 16,
            initial_peer_table_size: 32,
            pooled_buffer_count: 32,
        }
    }
}
