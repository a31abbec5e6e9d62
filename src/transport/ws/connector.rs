//! WebSocket connector: one binary message per application message.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

use crate::config::ConnectorParams;
use crate::error::{Error, Result};
use crate::transport::queue::{FrameSink, OutboundQueue};
use crate::transport::socket::SocketControl;
use crate::transport::{Connector, Link};

// ============================================================================
// Types
// ============================================================================

type WsWrite = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsRead = BoxStream<'static, std::result::Result<Message, WsError>>;

/// WebSocket limits for a maximum message length.
pub(crate) fn ws_config(max_msg_len: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_msg_len);
    config.max_frame_size = Some(max_msg_len);
    config
}

// ============================================================================
// MessageSink
// ============================================================================

/// Write half of the WebSocket, owned by the writer task.
struct MessageSink {
    sink: WsWrite,
}

#[async_trait]
impl FrameSink for MessageSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.sink.send(Message::binary(frame)).await?;
        Ok(())
    }

    async fn finish(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}

// ============================================================================
// WsConnector
// ============================================================================

/// Connector over an established WebSocket.
///
/// Text messages are delivered as their UTF-8 bytes; ping and pong are
/// answered by the WebSocket layer and never surface.
pub struct WsConnector {
    reader: Mutex<Option<WsRead>>,
    queue: OutboundQueue,
    max_msg_len: usize,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl WsConnector {
    pub(crate) fn from_stream<S>(
        ws: WebSocketStream<S>,
        control: SocketControl,
        params: &ConnectorParams,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let local_addr = control.local_addr();
        let remote_addr = control.peer_addr();
        let max_msg_len = params.max_msg_len as usize;

        let (write, read) = ws.split();
        let queue = OutboundQueue::spawn(
            MessageSink {
                sink: Box::pin(write),
            },
            params.write_queue_cap,
            control,
        );

        debug!(local = %local_addr, peer = %remote_addr, max_msg_len, "WebSocket connector created");

        Self {
            reader: Mutex::new(Some(read.boxed())),
            queue,
            max_msg_len,
            local_addr,
            remote_addr,
        }
    }

    /// Returns the maximum message length.
    #[inline]
    #[must_use]
    pub fn max_msg_len(&self) -> usize {
        self.max_msg_len
    }

    /// Returns the number of messages waiting for the writer.
    #[inline]
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.queue.pending()
    }

    /// Drops an idle read half once the socket was reset, so that the last
    /// descriptor closes and the reset reaches the peer. A read in progress
    /// is woken by the reset and releases the half itself.
    fn release_reader_if_reset(&self) {
        if !self.queue.control().is_reset() {
            return;
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn read_msg(&self) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let Some(read) = guard.as_mut() else {
            return Err(Error::ConnectionClosed);
        };

        loop {
            match read.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Text(text))) => return Ok(text.as_bytes().to_vec()),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    trace!(peer = %self.remote_addr, "Control frame skipped");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(peer = %self.remote_addr, ?frame, "WebSocket closed by peer");
                    *guard = None;
                    return Err(Error::ConnectionClosed);
                }
                None => {
                    *guard = None;
                    return Err(Error::ConnectionClosed);
                }
                Some(Err(e)) => {
                    debug!(peer = %self.remote_addr, error = %e, "WebSocket read failed, releasing reader");
                    *guard = None;
                    return Err(e.into());
                }
            }
        }
    }

    fn write_msg(&self, parts: &[&[u8]]) -> Result<()> {
        if self.queue.is_closed() {
            return Ok(());
        }

        let total: usize = parts.iter().map(|part| part.len()).sum();
        if total > self.max_msg_len {
            return Err(Error::message_too_long(total, self.max_msg_len));
        }
        if total == 0 {
            return Err(Error::MessageTooShort);
        }

        let message = match parts {
            [single] => single.to_vec(),
            _ => parts.concat(),
        };
        self.queue.push(message);
        self.release_reader_if_reset();
        Ok(())
    }

    fn close(&self) {
        self.queue.close();
    }

    fn destroy(&self) {
        self.queue.destroy();
        self.release_reader_if_reset();
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl Link for WsConnector {
    fn control(&self) -> &SocketControl {
        self.queue.control()
    }
}

impl Drop for WsConnector {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("max_msg_len", &self.max_msg_len)
            .field("queue_capacity", &self.queue.capacity())
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
