//! framelink - Message framing and connection lifecycle over TCP and WebSocket.
//!
//! This library gives network services symmetric client and server roles
//! over two transports:
//!
//! - **Stream**: raw TCP with a 2 or 4 byte length prefix per message
//! - **WebSocket**: one binary WebSocket message per message, optional TLS
//!
//! # Architecture
//!
//! ```text
//! Client / Server ─► Connector ─► AgentFactory ─► Agent::run ─► Agent::on_close
//!                        │
//!                        └─► outbound queue ─► writer task ─► socket
//! ```
//!
//! Key design principles:
//!
//! - Each connection is owned by exactly one [`Agent`]
//! - Writes never block: they are queued and a full queue disconnects the
//!   slow peer
//! - Reads are sequential and return whole messages only
//! - `close()` on clients and servers shuts sockets down, which is the only
//!   cancellation mechanism
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use framelink::{Agent, Connector, Result, TcpConnector, TcpServer};
//!
//! struct Echo(Arc<TcpConnector>);
//!
//! #[async_trait::async_trait]
//! impl Agent for Echo {
//!     async fn run(&mut self) {
//!         while let Ok(msg) = self.0.read_msg().await {
//!             if self.0.write_msg(&[msg.as_slice()]).is_err() {
//!                 break;
//!             }
//!         }
//!     }
//!
//!     async fn on_close(&mut self) {
//!         tracing::info!(peer = %self.0.remote_addr(), "echo closed");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = TcpServer::builder("127.0.0.1:6321")
//!         .max_connections(100)
//!         .agent(Echo)
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | [`Agent`] trait and factory type |
//! | [`config`] | Connector, client and server options |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`locker`] | [`Locker`] state guard |
//! | [`protocol`] | Length-prefix codec |
//! | [`transport`] | Connectors, clients and servers |
//!
//! # Logging
//!
//! The library emits [`tracing`] events and never installs a subscriber.

// ============================================================================
// Modules
// ============================================================================

/// Application hook driven per connection.
pub mod agent;

/// Connector, client and server configuration.
///
/// All option structs implement `serde::Deserialize` with defaults.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Lifecycle state guard.
pub mod locker;

/// Stream transport wire protocol.
pub mod protocol;

/// Connectors, clients and servers for both transports.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Agent types
pub use agent::{Agent, AgentFactory};

// Configuration types
pub use config::{ClientOptions, ConnectorParams, ServerOptions};

// Error types
pub use error::{Error, Result};

// Locker
pub use locker::{Locker, LockerGuard};

// Protocol types
pub use protocol::{ByteOrder, FrameCodec, HeaderWidth};

// Transport types
pub use transport::{
    ClientState, Connector, TcpClient, TcpClientBuilder, TcpConnector, TcpServer,
    TcpServerBuilder, WsClient, WsClientBuilder, WsConnector, WsServer, WsServerBuilder,
};
