//! Error types for framelink.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use framelink::{Connector, Result};
//!
//! async fn echo(conn: &impl Connector) -> Result<()> {
//!     let msg = conn.read_msg().await?;
//!     conn.write_msg(&[&msg])?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Protocol | [`Error::MessageTooLong`], [`Error::MessageTooShort`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::Handshake`], [`Error::HandshakeTimeout`] |
//! | External | [`Error::Io`], [`Error::WebSocket`] |
//!
//! Configuration errors are returned from `start()` and mean the service must
//! not run. Connection and external errors end the affected connection only.
//! Protocol errors go back to the caller of `read_msg`/`write_msg`.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::CapacityError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned from `start()` when a client or server is misconfigured:
    /// missing agent factory, invalid header width, unparsable address,
    /// incomplete or unreadable TLS material.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Message payload exceeds the configured maximum.
    ///
    /// On the read side the connection cannot be resynchronized afterwards
    /// and its read half is released.
    #[error("Message too long: {length} bytes (max {max})")]
    MessageTooLong {
        /// Payload length of the offending message.
        length: usize,
        /// Effective maximum payload length.
        max: usize,
    },

    /// Message payload is empty.
    ///
    /// Only the WebSocket transport rejects zero-length writes.
    #[error("Message too short")]
    MessageTooShort,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection is closed.
    ///
    /// Returned by reads once the transport has been shut down or a previous
    /// read failed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// WebSocket upgrade or TLS handshake rejected.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    /// Handshake did not complete in time.
    #[error("Handshake timeout after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] WsError),
}

// ============================================================================
// Conversions
// ============================================================================

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionClosed,
            WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                Self::MessageTooLong {
                    length: size,
                    max: max_size,
                }
            }
            WsError::Io(e) => Self::Io(e),
            other => Self::WebSocket(other),
        }
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a message too long error.
    #[inline]
    pub fn message_too_long(length: usize, max: usize) -> Self {
        Self::MessageTooLong { length, max }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a handshake timeout error.
    #[inline]
    pub fn handshake_timeout(timeout_ms: u64) -> Self {
        Self::HandshakeTimeout { timeout_ms }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a configuration error.
    #[inline]
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns `true` if this is a framing protocol error.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::MessageTooLong { .. } | Self::MessageTooShort)
    }

    /// Returns `true` if this error ends the connection.
    ///
    /// Everything except a rejected outbound write and a configuration
    /// problem is fatal for the connection it occurred on.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::Handshake { .. }
                | Self::HandshakeTimeout { .. }
                | Self::Io(_)
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
