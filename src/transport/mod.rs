//! Connection transports.
//!
//! Two transports share one contract, [`Connector`]:
//!
//! | Transport | Framing | Connector | Client | Server |
//! |-----------|---------|-----------|--------|--------|
//! | TCP stream | 2/4-byte length prefix | [`TcpConnector`] | [`TcpClient`] | [`TcpServer`] |
//! | WebSocket | one binary message per message | [`WsConnector`] | [`WsClient`] | [`WsServer`] |
//!
//! # Connection Lifecycle
//!
//! ```text
//! dial / accept ─► Connector ─► factory ─► Agent::run ─┐
//!                                                      │ transport fails / closed
//!                  Agent::on_close ◄─ release ◄────────┘
//! ```
//!
//! Each connector runs a dedicated writer task draining a bounded outbound
//! queue. Reads happen on the agent's task.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `tcp` | Length-prefixed TCP connector, client and server |
//! | `ws` | WebSocket connector, client and server |
//! | `client` | Dial and reconnect loop shared by both clients |
//! | `server` | Accept loop shared by both servers |
//! | `registry` | Live connection set of a server |
//! | `backoff` | Accept error backoff |
//! | `queue` | Outbound queue and writer task |
//! | `socket` | Socket shutdown and abortive reset |

// ============================================================================
// Submodules
// ============================================================================

/// Accept error backoff.
pub(crate) mod backoff;

/// Dial and reconnect loop.
pub(crate) mod client;

/// Outbound queue and writer task.
pub(crate) mod queue;

/// Live connection registry.
pub(crate) mod registry;

/// Accept loop.
pub(crate) mod server;

/// Socket control handle.
pub(crate) mod socket;

/// Length-prefixed TCP transport.
pub mod tcp;

/// WebSocket transport.
pub mod ws;

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

use self::socket::SocketControl;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::ClientState;
pub use tcp::{TcpClient, TcpClientBuilder, TcpConnector, TcpServer, TcpServerBuilder};
pub use ws::{WsClient, WsClientBuilder, WsConnector, WsServer, WsServerBuilder};

// ============================================================================
// Connector
// ============================================================================

/// Uniform contract of an established connection.
///
/// Connectors are shared behind `Arc`: one task reads, any task may write.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Reads the next complete message.
    ///
    /// Reads are sequential; concurrent callers wait for each other.
    ///
    /// # Errors
    ///
    /// - [`Error::MessageTooLong`](crate::Error::MessageTooLong) if the peer
    ///   announces an oversized message; the connection cannot be read
    ///   further
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) once the
    ///   transport is closed or a previous read failed
    /// - transport errors as they occur
    async fn read_msg(&self) -> Result<Vec<u8>>;

    /// Queues one message assembled from `parts`.
    ///
    /// Never blocks. A no-op once the connector is closed. A full outbound
    /// queue destroys the connection.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the message size is out of bounds; nothing
    /// is queued in that case.
    fn write_msg(&self, parts: &[&[u8]]) -> Result<()>;

    /// Closes gracefully: queued messages are flushed, then the transport is
    /// closed. Idempotent.
    fn close(&self);

    /// Resets the transport immediately, discarding queued messages.
    /// Idempotent.
    fn destroy(&self);

    /// Returns `true` once closing has begun.
    fn is_closed(&self) -> bool;

    /// Returns the local socket address.
    fn local_addr(&self) -> SocketAddr;

    /// Returns the peer socket address.
    fn remote_addr(&self) -> SocketAddr;
}

// ============================================================================
// Link
// ============================================================================

/// Connector whose socket can be controlled by the library.
pub(crate) trait Link: Connector {
    /// Returns the socket control handle.
    fn control(&self) -> &SocketControl;
}

// ============================================================================
// Shutdown Signal
// ============================================================================

/// Resolves once `shutdown` holds `true` or its sender is gone.
pub(crate) async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let done = *shutdown.borrow_and_update();
        if done {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
