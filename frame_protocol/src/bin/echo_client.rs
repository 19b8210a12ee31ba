// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use frame_protocol::{Client, DisconnectReason};

/// Command id the echo service answers on.
const ECHO: u16 = 42;

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value = "localhost")]
    hostname: String,

    #[arg(long, default_value_t = 4567)]
    port: u16,

    /// Text to send; the server echoes it back.
    #[arg(default_value = "hello")]
    message: String,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let client = Client::new();

    if !client.connect(&args.hostname, args.port) {
        eprintln!("could not connect to {}:{}", args.hostname, args.port);
        std::process::exit(1);
    }

    let handle = match client.send_request(ECHO, args.message.as_bytes()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("send failed: {e}");
            std::process::exit(1);
        }
    };

    match handle.wait() {
        Ok(payload) => println!("{}", String::from_utf8_lossy(&payload)),
        Err(e) => eprintln!("no echo: {e}"),
    }

    client.disconnect(DisconnectReason::Graceful);
}
