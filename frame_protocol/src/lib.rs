// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod frame;
pub mod peers;
pub mod pool;
pub mod reassembly;
pub mod ring;
pub mod router;
pub mod server;
pub mod state;
pub mod transport;
pub mod workers;

use std::fmt;
use std::net::SocketAddr;

pub use client::Client;
pub use router::RequestHandle;
pub use config::Config;
pub use dispatch::{CommandError, DispatchTable, SubscriberId};
pub use frame::{Frame, FrameError, Header, Mode, WireMessage};
pub use server::Server;

/// Command identifiers are 16-bit routing keys. Ids above [`USER_COMMAND_LIMIT`]
/// are reserved for the runtime's own commands.
pub type CommandId = u16;

/// Inclusive upper bound of the user-addressable command id space.
pub const USER_COMMAND_LIMIT: CommandId = 65500;

/// Reserved command ids. The range `USER_COMMAND_LIMIT + 1 ..` belongs to the
/// runtime; only these three are assigned so far.
pub mod commands {
    use super::CommandId;

    /// Echoed back by the remote endpoint with the payload and response id
    /// preserved.
    pub const PING: CommandId = 65535;

    /// Handshake sent by a connecting client; the server answers by echoing
    /// the payload once the peer has been admitted.
    pub const CONNECT: CommandId = 65534;

    /// Graceful teardown notice. No reply is sent.
    pub const DISCONNECT: CommandId = 65533;
}

/// The transport-level identity of a remote endpoint. Opaque to the routing
/// core; the concrete transport decides which variant it hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKey {
    /// A socket address, used by the TCP and UDP transports.
    Addr(SocketAddr),

    /// A raw file descriptor, used by socketpair-style transports that have
    /// no meaningful address.
    Fd(i32),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Addr(a) => write!(f, "{a}"),
            Self::Fd(fd) => write!(f, "fd:{fd}"),
        }
    }
}

/// The ways a send can fail. A successful send is `Ok(())`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The transport reported an error while sending.
    Socket,

    /// The endpoint has been closed.
    Disposed,

    /// The send flag is clear or the arguments were rejected (unknown peer,
    /// reserved command id, oversize payload).
    Invalid,

    /// An error that fits none of the other categories.
    Unknown,
}

impl std::error::Error for SendError {}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Socket => "transport error",
                Self::Disposed => "endpoint closed",
                Self::Invalid => "send rejected",
                Self::Unknown => "unknown send failure",
            }
        )
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side announced the teardown with a DISCONNECT frame.
    Graceful,

    /// The local endpoint was disposed while the connection was up.
    Aborted,

    /// The transport failed underneath the connection.
    Error,

    /// No reason was recorded.
    Unspecified,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Graceful => "graceful",
                Self::Aborted => "aborted",
                Self::Error => "transport error",
                Self::Unspecified => "unspecified",
            }
        )
    }
}

/// How waiting on a request's response can fail. A completed response carries
/// the payload instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    /// No response arrived within the configured response timeout. The
    /// connection itself is still up.
    Timeout,

    /// The connection was torn down while the request was outstanding.
    Aborted,
}

impl std::error::Error for ResponseError {}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Timeout => "response timed out",
                Self::Aborted => "connection closed while waiting",
            }
        )
    }
}

/// The possible errors surfaced by the runtime's fallible operations.
#[derive(Debug)]
pub enum Error {
    /// A frame failed to parse or validate. On the receive path these are
    /// recovered from locally and never reach the caller; this variant is
    /// for explicit codec use.
    Frame(FrameError),

    /// A dispatch-table registration was rejected.
    Command(CommandError),

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "Frame error: {e}"),
            Self::Command(e) => write!(f, "Command error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

/// An "pipe", constructed using socketpair(2), that can be used for testing
/// client and server behavior without a real network.
pub mod pipe {
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    use crate::PeerKey;

    pub struct Endpoint {
        fd: OwnedFd,
    }

    pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        Ok((Endpoint { fd: a }, Endpoint { fd: b }))
    }

    impl Endpoint {
        /// Duplicates the underlying descriptor so one half can be read
        /// while the other is written.
        pub fn try_clone(&self) -> std::io::Result<Endpoint> {
            Ok(Endpoint {
                fd: self.fd.try_clone()?,
            })
        }

        pub fn shutdown(&self) -> std::io::Result<()> {
            nix::sys::socket::shutdown(self.fd.as_raw_fd(), nix::sys::socket::Shutdown::Both)?;
            Ok(())
        }

        pub fn key(&self) -> PeerKey {
            PeerKey::Fd(self.fd.as_raw_fd())
        }
    }

    impl std::io::Read for Endpoint {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::read(&self.fd, buf)?)
        }
    }

    impl std::io::Write for Endpoint {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::write(&self.fd, buf)?)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
