//! Out-of-band control over a connection's TCP socket.
//!
//! Readers and writers own their halves of the transport (possibly wrapped
//! in TLS and WebSocket layers), so nobody else can close it directly.
//! [`SocketControl`] keeps a duplicate handle on the same socket that lets
//! clients, servers and connectors:
//!
//! - shut the socket down, which unblocks any pending read or write;
//! - reset it abortively (`SO_LINGER = 0`), discarding unsent data.
//!
//! A reset only goes out once the last descriptor of the socket closes.
//! [`SocketControl::reset`] therefore drops the duplicate handle; the owners
//! of the stream halves must release theirs without a graceful shutdown.

// ============================================================================
// Imports
// ============================================================================

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Result;

// ============================================================================
// SocketControl
// ============================================================================

/// Duplicate handle on a live TCP socket.
#[derive(Debug, Clone)]
pub(crate) struct SocketControl {
    socket: Arc<Mutex<Option<StdTcpStream>>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl SocketControl {
    /// Takes control of `stream`, returning it back ready for I/O.
    pub(crate) fn attach(stream: TcpStream) -> Result<(TcpStream, Self)> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let std_stream = stream.into_std()?;
        let socket = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        Ok((
            stream,
            Self {
                socket: Arc::new(Mutex::new(Some(socket))),
                local_addr,
                peer_addr,
            },
        ))
    }

    /// Returns the local address of the socket.
    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the peer address of the socket.
    #[inline]
    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Shuts down both directions. Pending reads observe end of stream.
    pub(crate) fn shutdown(&self) {
        self.shutdown_direction(Shutdown::Both);
    }

    /// Abortively resets the socket and releases the duplicate handle.
    ///
    /// Pending reads are woken with end of stream. The reset is sent once
    /// the stream halves are dropped too. Later calls are no-ops.
    pub(crate) fn reset(&self) {
        let Some(socket) = self.socket.lock().take() else {
            return;
        };
        if let Err(e) = SockRef::from(&socket).set_linger(Some(Duration::ZERO)) {
            debug!(error = %e, peer = %self.peer_addr, "Failed to set zero linger");
        }
        shutdown_socket(&socket, Shutdown::Read, self.peer_addr);
    }

    /// Returns `true` once [`reset`](Self::reset) has run.
    #[inline]
    pub(crate) fn is_reset(&self) -> bool {
        self.socket.lock().is_none()
    }

    fn shutdown_direction(&self, how: Shutdown) {
        if let Some(socket) = self.socket.lock().as_ref() {
            shutdown_socket(socket, how, self.peer_addr);
        }
    }
}

fn shutdown_socket(socket: &StdTcpStream, how: Shutdown, peer: SocketAddr) {
    match socket.shutdown(how) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotConnected => {}
        Err(e) => debug!(error = %e, peer = %peer, "Socket shutdown failed"),
    }
}

// ============================================================================
// Tests
// ============================================================================
