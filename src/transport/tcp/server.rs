//! Length-prefixed TCP server.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framelink::{Agent, Connector, TcpConnector, TcpServer};
//!
//! struct Echo(Arc<TcpConnector>);
//!
//! #[async_trait::async_trait]
//! impl Agent for Echo {
//!     async fn run(&mut self) {
//!         while let Ok(msg) = self.0.read_msg().await {
//!             if self.0.write_msg(&[&msg]).is_err() {
//!                 break;
//!             }
//!         }
//!     }
//!
//!     async fn on_close(&mut self) {}
//! }
//!
//! # async fn example() -> framelink::Result<()> {
//! let server = TcpServer::builder("0.0.0.0:6321")
//!     .max_connections(1000)
//!     .agent(Echo)
//!     .start()
//!     .await?;
//!
//! println!("listening on {}", server.local_addr());
//! server.close().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::agent::{Agent, AgentFactory, boxed_factory};
use crate::config::{ConnectorParams, ServerOptions};
use crate::error::{Error, Result};
use crate::protocol::FrameCodec;
use crate::transport::server::{Acceptor, ServerCore};
use crate::transport::socket::SocketControl;

use super::connector::TcpConnector;

// ============================================================================
// TcpAcceptor
// ============================================================================

struct TcpAcceptor {
    params: ConnectorParams,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Conn = TcpConnector;

    async fn establish(
        &self,
        stream: TcpStream,
        control: SocketControl,
    ) -> Result<Arc<TcpConnector>> {
        let conn = TcpConnector::with_control(stream, control, &self.params)?;
        Ok(Arc::new(conn))
    }
}

// ============================================================================
// TcpServer
// ============================================================================

/// Server accepting length-prefixed TCP connections.
///
/// Use [`TcpServer::builder()`] to configure and start one.
pub struct TcpServer {
    core: ServerCore,
}

impl TcpServer {
    /// Creates a builder listening on `listen_addr`.
    #[inline]
    #[must_use]
    pub fn builder(listen_addr: impl Into<String>) -> TcpServerBuilder {
        TcpServerBuilder::new(listen_addr)
    }

    /// Returns the bound address. Useful when listening on port 0.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    /// Returns `true` once close has begun.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Stops listening, closes every live connection and waits until every
    /// agent's `on_close` has returned. Idempotent.
    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

// ============================================================================
// TcpServerBuilder
// ============================================================================

/// Builder for [`TcpServer`].
pub struct TcpServerBuilder {
    options: ServerOptions,
    factory: Option<AgentFactory<TcpConnector>>,
}

impl TcpServerBuilder {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            options: ServerOptions::new(listen_addr),
            factory: None,
        }
    }

    /// Replaces all options, e.g. with ones loaded from a config file.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the maximum number of live connections.
    #[inline]
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.options.max_connections = count;
        self
    }

    /// Sets the framing and queue parameters.
    #[inline]
    #[must_use]
    pub fn params(mut self, params: ConnectorParams) -> Self {
        self.options.params = params;
        self
    }

    /// Sets the agent factory, called once per accepted connection.
    #[must_use]
    pub fn agent<F, A>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<TcpConnector>) -> A + Send + Sync + 'static,
        A: Agent,
    {
        self.factory = Some(boxed_factory(factory));
        self
    }

    /// Validates the configuration, binds and starts accepting.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no agent factory is set or the header width is
    ///   not 2 or 4
    /// - [`Error::Io`] if binding fails
    pub async fn start(self) -> Result<TcpServer> {
        let Self {
            mut options,
            factory,
        } = self;

        let factory = factory
            .ok_or_else(|| Error::config("agent factory is required. Use .agent() to set it."))?;
        options.normalize();
        FrameCodec::from_params(&options.params)?;

        let listener = TcpListener::bind(options.listen_addr.as_str()).await?;
        let acceptor = TcpAcceptor {
            params: options.params,
        };
        let core = ServerCore::spawn(listener, acceptor, factory, options.max_connections)?;

        Ok(TcpServer { core })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::assert_ok;

    struct Idle;

    #[async_trait]
    impl Agent for Idle {
        async fn run(&mut self) {}
        async fn on_close(&mut self) {}
    }

    #[tokio::test]
    async fn test_start_requires_agent() {
        let err = TcpServer::builder("127.0.0.1:0").start().await.unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_header_width() {
        let err = TcpServer::builder("127.0.0.1:0")
            .params(ConnectorParams::new().header_width(3))
            .agent(|_conn: Arc<TcpConnector>| Idle)
            .start()
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_bind_failure_is_io() {
        let err = TcpServer::builder("not an address")
            .agent(|_conn: Arc<TcpConnector>| Idle)
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_random_port() {
        let server = assert_ok!(
            TcpServer::builder("127.0.0.1:0")
                .max_connections(0)
                .agent(|_conn: Arc<TcpConnector>| Idle)
                .start()
                .await
        );

        assert!(server.local_addr().port() > 0);
        assert_eq!(server.connection_count(), 0);
        server.close().await;
        assert!(server.is_closed());
    }
}
