// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Seams between the runtime and the concrete sockets.
//!
//! The runtime never names a socket type directly: servers accept through
//! [`Listener`], connections read and write through [`Stream`]. TCP and
//! Unix sockets are provided; the socketpair [`pipe`](crate::pipe) endpoint
//! also qualifies, which is how the tests run a full client/server pair in
//! one process.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};

use crate::{pipe, PeerKey};

/// A duplex byte stream the runtime can split into a receive half and a
/// send half.
pub trait Stream: Read + Write + Send + Sync + Sized + 'static {
    /// A second handle onto the same stream, so one thread can block in
    /// `read` while others write.
    fn try_clone(&self) -> io::Result<Self>;

    /// Closes both directions, unblocking any reader.
    fn shutdown(&self) -> io::Result<()>;

    /// The remote endpoint's identity.
    fn peer_key(&self) -> io::Result<PeerKey>;
}

impl Stream for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }

    fn peer_key(&self) -> io::Result<PeerKey> {
        Ok(PeerKey::Addr(self.peer_addr()?))
    }
}

impl Stream for UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, std::net::Shutdown::Both)
    }

    fn peer_key(&self) -> io::Result<PeerKey> {
        Ok(PeerKey::Fd(self.as_raw_fd()))
    }
}

impl Stream for pipe::Endpoint {
    fn try_clone(&self) -> io::Result<Self> {
        pipe::Endpoint::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        pipe::Endpoint::shutdown(self)
    }

    fn peer_key(&self) -> io::Result<PeerKey> {
        Ok(self.key())
    }
}

/// A trait that allows the server to be generic over both TcpListener and
/// UnixListener (and anything else that accepts [`Stream`]s).
pub trait Listener<S: Stream>: Send + Sync + 'static {
    fn accept(&self) -> io::Result<S>;

    /// Unblocks a thread parked in `accept`.
    fn shutdown(&self) -> io::Result<()>;
}

impl Listener<TcpStream> for TcpListener {
    fn accept(&self) -> io::Result<TcpStream> {
        Ok(TcpListener::accept(self)?.0)
    }

    fn shutdown(&self) -> io::Result<()> {
        // There is no std shutdown for listeners; shutdown(2) on the fd
        // makes a blocked accept return.
        nix::sys::socket::shutdown(self.as_raw_fd(), nix::sys::socket::Shutdown::Both)?;
        Ok(())
    }
}

impl Listener<UnixStream> for UnixListener {
    fn accept(&self) -> io::Result<UnixStream> {
        Ok(UnixListener::accept(self)?.0)
    }

    fn shutdown(&self) -> io::Result<()> {
        nix::sys::socket::shutdown(self.as_raw_fd(), nix::sys::socket::Shutdown::Both)?;
        Ok(())
    }
}

/// Object-safe send half of a stream, shared between the connection's
/// receive loop (echoes) and user send paths.
pub(crate) trait SendHalf: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<S: Stream> SendHalf for S {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }
}

/// A shareable handle on a stream's send half. The writer mutex serializes
/// whole frames so concurrent senders cannot interleave bytes; the closer
/// is a second handle on the same socket so teardown never waits behind a
/// blocked writer.
#[derive(Clone)]
pub(crate) struct Link {
    shared: Arc<LinkShared>,
}

struct LinkShared {
    writer: Mutex<Box<dyn SendHalf>>,
    closer: Box<dyn Fn() + Send + Sync>,
}

impl Link {
    pub(crate) fn from_stream<S: Stream>(stream: S) -> io::Result<Link> {
        let closer = stream.try_clone()?;

        Ok(Link {
            shared: Arc::new(LinkShared {
                writer: Mutex::new(Box::new(stream)),
                closer: Box::new(move || {
                    let _ = closer.shutdown();
                }),
            }),
        })
    }

    pub(crate) fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.shared.writer.lock().unwrap().send(bytes)
    }

    pub(crate) fn close(&self) {
        (self.shared.closer)();
    }
}
