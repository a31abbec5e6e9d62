//! Application hook driven by clients and servers.
//!
//! For every established connection the library calls the application's
//! factory with the new connector, then runs the returned [`Agent`]:
//!
//! 1. [`Agent::run`] consumes the connector until the transport fails or is
//!    closed.
//! 2. The library closes the connector and forgets the connection.
//! 3. [`Agent::on_close`] is called exactly once, never concurrently with
//!    `run`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use framelink::{Agent, Connector, TcpConnector};
//!
//! struct Echo {
//!     conn: Arc<TcpConnector>,
//! }
//!
//! #[async_trait::async_trait]
//! impl Agent for Echo {
//!     async fn run(&mut self) {
//!         while let Ok(msg) = self.conn.read_msg().await {
//!             if self.conn.write_msg(&[&msg]).is_err() {
//!                 break;
//!             }
//!         }
//!     }
//!
//!     async fn on_close(&mut self) {
//!         tracing::info!(addr = %self.conn.remote_addr(), "echo agent closed");
//!     }
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

// ============================================================================
// Agent
// ============================================================================

/// Consumer of one connection.
#[async_trait]
pub trait Agent: Send + 'static {
    /// Drives the connection. Returns when the application is done with it
    /// or a read fails.
    async fn run(&mut self);

    /// Called once after the connection has been released.
    async fn on_close(&mut self);
}

// ============================================================================
// AgentFactory
// ============================================================================

/// Builds an [`Agent`] for a freshly established connector.
pub type AgentFactory<C> = Arc<dyn Fn(Arc<C>) -> Box<dyn Agent> + Send + Sync>;

/// Boxes a typed factory closure into an [`AgentFactory`].
pub(crate) fn boxed_factory<C, F, A>(factory: F) -> AgentFactory<C>
where
    C: 'static,
    F: Fn(Arc<C>) -> A + Send + Sync + 'static,
    A: Agent,
{
    Arc::new(move |conn| Box::new(factory(conn)) as Box<dyn Agent>)
}

// ============================================================================
// Tests
// ============================================================================
