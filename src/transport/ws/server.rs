//! WebSocket server, optionally behind TLS.
//!
//! Every accepted connection goes through:
//!
//! 1. TLS handshake when a certificate is configured
//! 2. Method check: anything but `GET` is answered with `405 Method Not
//!    Allowed` and closed
//! 3. WebSocket upgrade with the message size limit applied; request headers
//!    beyond 1 KiB are answered with `431 Request Header Fields Too Large`
//!
//! Steps 1 to 3 together are bounded by the handshake timeout.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::path::PathBuf;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentFactory, boxed_factory};
use crate::config::{ConnectorParams, DEFAULT_WS_SERVER_WRITE_QUEUE_CAP, ServerOptions};
use crate::error::{Error, Result};
use crate::transport::server::{Acceptor, ServerCore};
use crate::transport::socket::SocketControl;

use super::connector::{WsConnector, ws_config};
use super::tls;

// ============================================================================
// Constants
// ============================================================================

const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 19\r\n\
Connection: close\r\n\
\r\n\
Method not allowed\n";

/// Cap on the upgrade request's header fields.
const MAX_HEADER_BYTES: usize = 1024;

// ============================================================================
// WsAcceptor
// ============================================================================

struct WsAcceptor {
    params: ConnectorParams,
    handshake_timeout: Duration,
    tls: Option<TlsAcceptor>,
}

impl WsAcceptor {
    async fn upgrade<S>(&self, stream: S, control: SocketControl) -> Result<Arc<WsConnector>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = BufReader::new(stream);

        if !starts_with_get(&mut stream).await? {
            if let Err(e) = stream.write_all(METHOD_NOT_ALLOWED).await {
                debug!(error = %e, "Failed to send 405 response");
            }
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Failed to shut down rejected connection");
            }
            return Err(Error::handshake("method not allowed"));
        }

        let config = ws_config(self.params.max_msg_len as usize);
        let ws = accept_hdr_async_with_config(stream, check_headers, Some(config))
            .await
            .map_err(|e| Error::handshake(format!("WebSocket upgrade failed: {e}")))?;

        Ok(Arc::new(WsConnector::from_stream(ws, control, &self.params)))
    }
}

#[async_trait]
impl Acceptor for WsAcceptor {
    type Conn = WsConnector;

    async fn establish(
        &self,
        stream: TcpStream,
        control: SocketControl,
    ) -> Result<Arc<WsConnector>> {
        let handshake = async {
            match &self.tls {
                Some(acceptor) => {
                    let stream = acceptor
                        .accept(stream)
                        .await
                        .map_err(|e| Error::handshake(format!("TLS handshake failed: {e}")))?;
                    self.upgrade(stream, control).await
                }
                None => self.upgrade(stream, control).await,
            }
        };

        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| Error::handshake_timeout(self.handshake_timeout.as_millis() as u64))?
    }
}

/// Handshake callback rejecting oversized header sections.
fn check_headers(request: &Request, response: Response) -> StdResult<Response, ErrorResponse> {
    let size = header_bytes(request);
    if size <= MAX_HEADER_BYTES {
        return Ok(response);
    }

    debug!(size, max = MAX_HEADER_BYTES, "Upgrade request headers too large");
    let mut rejection = ErrorResponse::new(Some(String::from("Request header fields too large")));
    *rejection.status_mut() = StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE;
    Err(rejection)
}

/// Size of the header fields as sent: `name: value\r\n` per field.
fn header_bytes(request: &Request) -> usize {
    request
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum()
}

/// Returns `false` if the buffered request line cannot start with `GET `.
///
/// Only the bytes already received are inspected; a request split before
/// its fourth byte is left to the upgrade to judge.
async fn starts_with_get<S>(stream: &mut BufReader<S>) -> Result<bool>
where
    S: AsyncRead + Unpin,
{
    const GET: &[u8] = b"GET ";

    let buf = stream.fill_buf().await?;
    if buf.is_empty() {
        return Err(Error::ConnectionClosed);
    }

    let n = buf.len().min(GET.len());
    Ok(buf[..n] == GET[..n])
}

// ============================================================================
// WsServer
// ============================================================================

/// Server accepting WebSocket connections.
///
/// Use [`WsServer::builder()`] to configure and start one.
pub struct WsServer {
    core: ServerCore,
    tls: bool,
}

impl WsServer {
    /// Creates a builder listening on `listen_addr`.
    #[inline]
    #[must_use]
    pub fn builder(listen_addr: impl Into<String>) -> WsServerBuilder {
        WsServerBuilder::new(listen_addr)
    }

    /// Returns the bound address. Useful when listening on port 0.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Returns the URL clients should dial, `ws://` or `wss://`.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}", self.local_addr())
    }

    /// Returns the number of live connections, including those still in
    /// the handshake.
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

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("url", &self.url())
            .field("connections", &self.connection_count())
            .finish()
    }
}

// ============================================================================
// WsServerBuilder
// ============================================================================

/// Builder for [`WsServer`].
pub struct WsServerBuilder {
    options: ServerOptions,
    factory: Option<AgentFactory<WsConnector>>,
}

impl WsServerBuilder {
    /// Creates a builder with default options.
    ///
    /// The outbound queue capacity defaults to
    /// [`DEFAULT_WS_SERVER_WRITE_QUEUE_CAP`] rather than the client and TCP
    /// server default.
    #[inline]
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        let mut options = ServerOptions::new(listen_addr);
        options.params.write_queue_cap = DEFAULT_WS_SERVER_WRITE_QUEUE_CAP;
        Self {
            options,
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

    /// Sets the TLS + upgrade handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    /// Enables TLS with PEM certificate chain and private key files.
    #[inline]
    #[must_use]
    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.options = self.options.tls(cert, key);
        self
    }

    /// Sets the message size and queue parameters. The header width and
    /// byte order are not used by this transport.
    #[inline]
    #[must_use]
    pub fn params(mut self, params: ConnectorParams) -> Self {
        self.options.params = params;
        self
    }

    /// Sets the agent factory, called once per upgraded connection.
    #[must_use]
    pub fn agent<F, A>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<WsConnector>) -> A + Send + Sync + 'static,
        A: Agent,
    {
        self.factory = Some(boxed_factory(factory));
        self
    }

    /// Validates the configuration, loads TLS material, binds and starts
    /// accepting.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no agent factory is set, only one of the TLS
    ///   certificate and key is set, or the TLS files are unusable
    /// - [`Error::Io`] if binding fails
    pub async fn start(self) -> Result<WsServer> {
        let Self {
            mut options,
            factory,
        } = self;

        let factory = factory
            .ok_or_else(|| Error::config("agent factory is required. Use .agent() to set it."))?;
        if options.params.write_queue_cap == 0 {
            options.params.write_queue_cap = DEFAULT_WS_SERVER_WRITE_QUEUE_CAP;
            warn!(
                write_queue_cap = options.params.write_queue_cap,
                "invalid write_queue_cap, reset to default"
            );
        }
        options.normalize();
        let tls = tls::resolve(options.tls_cert.as_deref(), options.tls_key.as_deref())?;
        let secure = tls.is_some();

        let listener = TcpListener::bind(options.listen_addr.as_str()).await?;
        let acceptor = WsAcceptor {
            params: options.params,
            handshake_timeout: options.handshake_timeout,
            tls,
        };
        let core = ServerCore::spawn(listener, acceptor, factory, options.max_connections)?;

        if secure {
            info!(addr = %core.local_addr(), "TLS enabled");
        }

        Ok(WsServer { core, tls: secure })
    }
}

// ============================================================================
// Tests
// ============================================================================
