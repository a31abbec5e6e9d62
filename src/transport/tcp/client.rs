//! Length-prefixed TCP client.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use framelink::{Agent, Connector, TcpClient, TcpConnector};
//! use std::sync::Arc;
//!
//! struct Printer(Arc<TcpConnector>);
//!
//! #[async_trait::async_trait]
//! impl Agent for Printer {
//!     async fn run(&mut self) {
//!         while let Ok(msg) = self.0.read_msg().await {
//!             println!("{} bytes", msg.len());
//!         }
//!     }
//!
//!     async fn on_close(&mut self) {}
//! }
//!
//! # async fn example() -> framelink::Result<()> {
//! let client = TcpClient::builder("127.0.0.1:6321")
//!     .auto_reconnect(true)
//!     .connect_interval(Duration::from_secs(1))
//!     .agent(Printer)
//!     .start()?;
//!
//! // ...
//! client.close().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::agent::{Agent, AgentFactory, boxed_factory};
use crate::config::{ClientOptions, ConnectorParams};
use crate::error::{Error, Result};
use crate::protocol::FrameCodec;
use crate::transport::client::{ClientCore, ClientState, Dialer, ReconnectPolicy};
use crate::transport::socket::SocketControl;

use super::connector::TcpConnector;

// ============================================================================
// TcpDialer
// ============================================================================

struct TcpDialer {
    addr: String,
    params: ConnectorParams,
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpConnector;

    async fn dial(&self) -> Result<Arc<TcpConnector>> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        let (stream, control) = SocketControl::attach(stream)?;
        let conn = TcpConnector::with_control(stream, control, &self.params)?;
        Ok(Arc::new(conn))
    }

    fn target(&self) -> &str {
        &self.addr
    }
}

// ============================================================================
// TcpClient
// ============================================================================

/// Client dialing a length-prefixed TCP endpoint.
///
/// Use [`TcpClient::builder()`] to configure and start one.
pub struct TcpClient {
    core: ClientCore,
    remote_addr: String,
}

impl TcpClient {
    /// Creates a builder dialing `remote_addr` (`host:port`).
    #[inline]
    #[must_use]
    pub fn builder(remote_addr: impl Into<String>) -> TcpClientBuilder {
        TcpClientBuilder::new(remote_addr)
    }

    /// Returns the configured remote endpoint.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Returns the current phase.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.core.state()
    }

    /// Returns `true` once the client is closed or has finished.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Closes the client.
    ///
    /// Shuts down the current connection, stops any retry and waits for the
    /// agent's `on_close`. Idempotent.
    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TcpClientBuilder
// ============================================================================

/// Builder for [`TcpClient`].
pub struct TcpClientBuilder {
    options: ClientOptions,
    factory: Option<AgentFactory<TcpConnector>>,
}

impl TcpClientBuilder {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            options: ClientOptions::new(remote_addr),
            factory: None,
        }
    }

    /// Replaces all options, e.g. with ones loaded from a config file.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables or disables reconnecting after the connection is lost.
    #[inline]
    #[must_use]
    pub fn auto_reconnect(mut self, flag: bool) -> Self {
        self.options.auto_reconnect = flag;
        self
    }

    /// Sets the delay between dial attempts.
    #[inline]
    #[must_use]
    pub fn connect_interval(mut self, interval: Duration) -> Self {
        self.options.connect_interval = interval;
        self
    }

    /// Sets the framing and queue parameters.
    #[inline]
    #[must_use]
    pub fn params(mut self, params: ConnectorParams) -> Self {
        self.options.params = params;
        self
    }

    /// Sets the agent factory, called once per established connection.
    #[must_use]
    pub fn agent<F, A>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<TcpConnector>) -> A + Send + Sync + 'static,
        A: Agent,
    {
        self.factory = Some(boxed_factory(factory));
        self
    }

    /// Validates the configuration and spawns the client.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no agent factory is set, the remote
    /// address is not `host:port` or the header width is not 2 or 4.
    pub fn start(self) -> Result<TcpClient> {
        let Self {
            mut options,
            factory,
        } = self;

        let factory = factory
            .ok_or_else(|| Error::config("agent factory is required. Use .agent() to set it."))?;
        validate_host_port(&options.remote_addr)?;
        options.normalize();
        FrameCodec::from_params(&options.params)?;

        let remote_addr = options.remote_addr.clone();
        let dialer = TcpDialer {
            addr: options.remote_addr,
            params: options.params,
        };
        let core = ClientCore::spawn(
            dialer,
            factory,
            ReconnectPolicy {
                interval: options.connect_interval,
                auto_reconnect: options.auto_reconnect,
            },
        );

        Ok(TcpClient { core, remote_addr })
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Checks that `addr` is `host:port`.
pub(crate) fn validate_host_port(addr: &str) -> Result<()> {
    let valid = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());

    if valid {
        Ok(())
    } else {
        Err(Error::config(format!(
            "invalid address {addr:?}, expected host:port"
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================
