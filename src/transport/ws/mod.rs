//! WebSocket transport.
//!
//! Messages map one to one onto binary WebSocket messages; there is no
//! extra length prefix. The maximum message length is enforced by the
//! WebSocket layer on reads and by the connector on writes.
//!
//! | Type | Role |
//! |------|------|
//! | [`WsConnector`] | One upgraded connection |
//! | [`WsClient`] | Dials `ws://` or `wss://`, optionally reconnects |
//! | [`WsServer`] | HTTP upgrade endpoint, optional TLS |

mod client;
mod connector;
mod server;
mod tls;

pub use client::{WsClient, WsClientBuilder};
pub use connector::WsConnector;
pub use server::{WsServer, WsServerBuilder};
