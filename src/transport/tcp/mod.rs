//! Length-prefixed TCP transport.
//!
//! | Type | Role |
//! |------|------|
//! | [`TcpConnector`] | One framed connection |
//! | [`TcpClient`] | Dials and optionally reconnects |
//! | [`TcpServer`] | Accepts up to a maximum number of connections |

mod client;
mod connector;
mod server;

pub use client::{TcpClient, TcpClientBuilder};
pub use connector::TcpConnector;
pub use server::{TcpServer, TcpServerBuilder};

