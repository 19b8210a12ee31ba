// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use frame_protocol::server::{Remote, Server};
use frame_protocol::Config;

/// Command id the echo service answers on.
const ECHO: u16 = 42;

#[derive(Parser)]
struct Cli {
    #[arg(long, default_value_t = 4567)]
    port: u16,

    #[arg(long, default_value_t = 4096)]
    max_packet: u16,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let config = Config {
        max_packet_size: args.max_packet,
        ..Config::default()
    };

    let server: Server<()> = Server::with_config(config, |_key| Some(()));

    server
        .add_wire_command::<String>(ECHO)
        .expect("ECHO is a user command id");

    server
        .add_subscriber(ECHO, |remote: &Remote<()>, message: &String| {
            println!("{}: {message}", remote.key());
            let _ = remote.reply_value(ECHO, message);
        })
        .expect("ECHO was just registered");

    server.set_on_connected(|peer| println!("connected: {}", peer.key()));
    server.set_on_disconnected(|key, reason| println!("disconnected: {key} ({reason})"));

    if !server.run(args.port) {
        std::process::exit(1);
    }

    println!("echo server listening on port {}", args.port);

    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
