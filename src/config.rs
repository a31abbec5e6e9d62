//! Connector, client and server configuration.
//!
//! Every option struct has a builder-style API and derives
//! [`serde::Deserialize`] with defaults, so applications can load it from
//! their own configuration files. Durations are given in milliseconds
//! (`*_ms` keys) when deserialized.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use framelink::{ByteOrder, ClientOptions, ConnectorParams};
//!
//! let params = ConnectorParams::new()
//!     .header_width(4)
//!     .byte_order(ByteOrder::Little)
//!     .max_msg_len(64 * 1024);
//!
//! let options = ClientOptions::new("127.0.0.1:6321")
//!     .auto_reconnect(true)
//!     .connect_interval(Duration::from_secs(1))
//!     .params(params);
//! # let _ = options;
//! ```
//!
//! Zero values are replaced with defaults when a client or server starts;
//! each replacement is logged at `warn` level.

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::protocol::ByteOrder;

// ============================================================================
// Constants
// ============================================================================

/// Default length-prefix width in bytes.
pub const DEFAULT_HEADER_WIDTH: u8 = 2;

/// Default maximum payload length.
pub const DEFAULT_MAX_MSG_LEN: u32 = 4096;

/// Default outbound queue capacity for clients and the TCP server.
pub const DEFAULT_WRITE_QUEUE_CAP: usize = 100;

/// Default outbound queue capacity for the WebSocket server.
pub const DEFAULT_WS_SERVER_WRITE_QUEUE_CAP: usize = 1024;

/// Default maximum number of live server connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Default delay between dial attempts.
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Default WebSocket handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ConnectorParams
// ============================================================================

/// Framing and queueing parameters shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorParams {
    /// Length-prefix width in bytes: 2 or 4. Stream transport only.
    pub header_width: u8,

    /// Byte order of the length prefix.
    pub byte_order: ByteOrder,

    /// Maximum payload length. Clamped to what the header width can encode.
    pub max_msg_len: u32,

    /// Outbound queue capacity. A write that finds the queue full destroys
    /// the connection.
    pub write_queue_cap: usize,
}

impl Default for ConnectorParams {
    fn default() -> Self {
        Self {
            header_width: DEFAULT_HEADER_WIDTH,
            byte_order: ByteOrder::Big,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            write_queue_cap: DEFAULT_WRITE_QUEUE_CAP,
        }
    }
}

impl ConnectorParams {
    /// Creates parameters with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the length-prefix width in bytes.
    ///
    /// Only 2 and 4 are valid; anything else is reported when the client
    /// or server starts.
    #[inline]
    #[must_use]
    pub fn header_width(mut self, bytes: u8) -> Self {
        self.header_width = bytes;
        self
    }

    /// Sets the length-prefix byte order.
    #[inline]
    #[must_use]
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Uses little-endian length prefixes when `flag` is set.
    #[inline]
    #[must_use]
    pub fn little_endian(self, flag: bool) -> Self {
        self.byte_order(if flag {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        })
    }

    /// Sets the maximum payload length.
    #[inline]
    #[must_use]
    pub fn max_msg_len(mut self, len: u32) -> Self {
        self.max_msg_len = len;
        self
    }

    /// Sets the outbound queue capacity.
    #[inline]
    #[must_use]
    pub fn write_queue_cap(mut self, cap: usize) -> Self {
        self.write_queue_cap = cap;
        self
    }

    /// Replaces zero values with defaults.
    pub(crate) fn normalize(&mut self) {
        if self.max_msg_len == 0 {
            self.max_msg_len = DEFAULT_MAX_MSG_LEN;
            warn!(max_msg_len = self.max_msg_len, "invalid max_msg_len, reset to default");
        }
        if self.write_queue_cap == 0 {
            self.write_queue_cap = DEFAULT_WRITE_QUEUE_CAP;
            warn!(
                write_queue_cap = self.write_queue_cap,
                "invalid write_queue_cap, reset to default"
            );
        }
    }
}

// ============================================================================
// ClientOptions
// ============================================================================

/// Options for [`TcpClient`](crate::TcpClient) and [`WsClient`](crate::WsClient).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Remote endpoint: `host:port` for TCP, a `ws://` or `wss://` URL for
    /// WebSocket.
    pub remote_addr: String,

    /// Delay between failed dial attempts and before reconnecting.
    #[serde(rename = "connect_interval_ms", deserialize_with = "millis")]
    pub connect_interval: Duration,

    /// Dial again after the connection is lost.
    pub auto_reconnect: bool,

    /// Bound on the WebSocket upgrade handshake. WebSocket only.
    #[serde(rename = "handshake_timeout_ms", deserialize_with = "millis")]
    pub handshake_timeout: Duration,

    /// Connector parameters.
    pub params: ConnectorParams,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            remote_addr: String::new(),
            connect_interval: DEFAULT_CONNECT_INTERVAL,
            auto_reconnect: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            params: ConnectorParams::default(),
        }
    }
}

impl ClientOptions {
    /// Creates options dialing `remote_addr`.
    #[inline]
    #[must_use]
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Default::default()
        }
    }

    /// Sets the remote endpoint.
    #[inline]
    #[must_use]
    pub fn remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    /// Sets the retry/reconnect interval.
    #[inline]
    #[must_use]
    pub fn connect_interval(mut self, interval: Duration) -> Self {
        self.connect_interval = interval;
        self
    }

    /// Enables or disables automatic reconnection.
    #[inline]
    #[must_use]
    pub fn auto_reconnect(mut self, flag: bool) -> Self {
        self.auto_reconnect = flag;
        self
    }

    /// Sets the WebSocket handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the connector parameters.
    #[inline]
    #[must_use]
    pub fn params(mut self, params: ConnectorParams) -> Self {
        self.params = params;
        self
    }

    /// Replaces zero values with defaults.
    pub(crate) fn normalize(&mut self) {
        if self.connect_interval.is_zero() {
            self.connect_interval = DEFAULT_CONNECT_INTERVAL;
            warn!(
                interval_ms = self.connect_interval.as_millis() as u64,
                "invalid connect_interval, reset to default"
            );
        }
        if self.handshake_timeout.is_zero() {
            self.handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT;
            warn!(
                timeout_ms = self.handshake_timeout.as_millis() as u64,
                "invalid handshake_timeout, reset to default"
            );
        }
        self.params.normalize();
    }
}

// ============================================================================
// ServerOptions
// ============================================================================

/// Options for [`TcpServer`](crate::TcpServer) and [`WsServer`](crate::WsServer).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Address to listen on, e.g. `0.0.0.0:6321`. Port 0 picks a free port.
    pub listen_addr: String,

    /// Live connections admitted at once. Extra connections are closed on
    /// accept.
    pub max_connections: usize,

    /// Bound on the TLS + WebSocket upgrade handshake. WebSocket only.
    #[serde(rename = "handshake_timeout_ms", deserialize_with = "millis")]
    pub handshake_timeout: Duration,

    /// PEM certificate chain. TLS is enabled when both this and
    /// `tls_key` are set. WebSocket only.
    pub tls_cert: Option<PathBuf>,

    /// PEM private key. WebSocket only.
    pub tls_key: Option<PathBuf>,

    /// Connector parameters.
    pub params: ConnectorParams,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: String::from("127.0.0.1:0"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls_cert: None,
            tls_key: None,
            params: ConnectorParams::default(),
        }
    }
}

impl ServerOptions {
    /// Creates options listening on `listen_addr`.
    #[inline]
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    /// Sets the listen address.
    #[inline]
    #[must_use]
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Sets the maximum number of live connections.
    #[inline]
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Sets the WebSocket handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Enables TLS with the given PEM certificate chain and private key.
    #[inline]
    #[must_use]
    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls_cert = Some(cert.into());
        self.tls_key = Some(key.into());
        self
    }

    /// Sets the connector parameters.
    #[inline]
    #[must_use]
    pub fn params(mut self, params: ConnectorParams) -> Self {
        self.params = params;
        self
    }

    /// Replaces zero values with defaults.
    pub(crate) fn normalize(&mut self) {
        if self.max_connections == 0 {
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
            warn!(
                max_connections = self.max_connections,
                "invalid max_connections, reset to default"
            );
        }
        if self.handshake_timeout.is_zero() {
            self.handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT;
            warn!(
                timeout_ms = self.handshake_timeout.as_millis() as u64,
                "invalid handshake_timeout, reset to default"
            );
        }
        self.params.normalize();
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

// ============================================================================
// Tests
// ============================================================================
