//! WebSocket client for `ws://` and `wss://` endpoints.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::client_async_tls_with_config;
use url::{Host, Url};

use crate::agent::{Agent, AgentFactory, boxed_factory};
use crate::config::{ClientOptions, ConnectorParams};
use crate::error::{Error, Result};
use crate::transport::client::{ClientCore, ClientState, Dialer, ReconnectPolicy};
use crate::transport::socket::SocketControl;

use super::connector::{WsConnector, ws_config};

// ============================================================================
// Endpoint
// ============================================================================

/// Parsed WebSocket endpoint.
#[derive(Debug, Clone)]
struct Endpoint {
    url: Url,
    host: String,
    port: u16,
}

impl Endpoint {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| Error::config(format!("invalid WebSocket URL {raw:?}: {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "unsupported scheme {:?} in {raw:?}, expected ws or wss",
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(Error::config(format!("missing host in {raw:?}"))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::config(format!("missing port in {raw:?}")))?;

        Ok(Self { url, host, port })
    }
}

// ============================================================================
// WsDialer
// ============================================================================

struct WsDialer {
    endpoint: Endpoint,
    handshake_timeout: Duration,
    params: ConnectorParams,
}

#[async_trait]
impl Dialer for WsDialer {
    type Conn = WsConnector;

    async fn dial(&self) -> Result<Arc<WsConnector>> {
        let stream = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        let (stream, control) = SocketControl::attach(stream)?;

        let config = ws_config(self.params.max_msg_len as usize);
        let handshake =
            client_async_tls_with_config(self.endpoint.url.as_str(), stream, Some(config), None);

        let (ws, _response) = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| Error::handshake_timeout(self.handshake_timeout.as_millis() as u64))?
            .map_err(|e| Error::handshake(format!("WebSocket handshake failed: {e}")))?;

        Ok(Arc::new(WsConnector::from_stream(ws, control, &self.params)))
    }

    fn target(&self) -> &str {
        self.endpoint.url.as_str()
    }
}

// ============================================================================
// WsClient
// ============================================================================

/// Client dialing a WebSocket endpoint.
///
/// Use [`WsClient::builder()`] to configure and start one.
pub struct WsClient {
    core: ClientCore,
    url: String,
}

impl WsClient {
    /// Creates a builder dialing `url` (`ws://host:port/path` or `wss://…`).
    #[inline]
    #[must_use]
    pub fn builder(url: impl Into<String>) -> WsClientBuilder {
        WsClientBuilder::new(url)
    }

    /// Returns the configured endpoint URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
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

    /// Closes the client and waits for the agent's `on_close`. Idempotent.
    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// WsClientBuilder
// ============================================================================

/// Builder for [`WsClient`].
pub struct WsClientBuilder {
    options: ClientOptions,
    factory: Option<AgentFactory<WsConnector>>,
}

impl WsClientBuilder {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            options: ClientOptions::new(url),
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

    /// Sets the upgrade handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    /// Sets the message size and queue parameters.
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
        F: Fn(Arc<WsConnector>) -> A + Send + Sync + 'static,
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
    /// Returns [`Error::Config`] if no agent factory is set or the URL is not
    /// a valid `ws://` / `wss://` URL.
    pub fn start(self) -> Result<WsClient> {
        let Self {
            mut options,
            factory,
        } = self;

        let factory = factory
            .ok_or_else(|| Error::config("agent factory is required. Use .agent() to set it."))?;
        let endpoint = Endpoint::parse(&options.remote_addr)?;
        options.normalize();

        let url = options.remote_addr.clone();
        let dialer = WsDialer {
            endpoint,
            handshake_timeout: options.handshake_timeout,
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

        Ok(WsClient { core, url })
    }
}

// ============================================================================
// Tests
// ============================================================================
