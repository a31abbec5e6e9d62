//! Length-prefixed TCP connector.
//!
//! Wire format: `[length: 2|4 bytes][payload]`, see
//! [`FrameCodec`](crate::FrameCodec).

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ConnectorParams;
use crate::error::{Error, Result};
use crate::protocol::FrameCodec;
use crate::transport::queue::{FrameSink, OutboundQueue};
use crate::transport::socket::SocketControl;
use crate::transport::{Connector, Link};

// ============================================================================
// StreamSink
// ============================================================================

/// Write half of the TCP stream, owned by the writer task.
struct StreamSink {
    half: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for StreamSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.half.write_all(&frame).await?;
        Ok(())
    }

    async fn finish(&mut self) {
        if let Err(e) = self.half.shutdown().await {
            debug!(error = %e, "TCP write shutdown failed");
        }
    }

    fn abort(self) {
        // no FIN: the reset must be the last thing the peer sees
        self.half.forget();
    }
}

// ============================================================================
// TcpConnector
// ============================================================================

/// Connector over a length-prefixed TCP stream.
///
/// Reads happen on the caller's task and are serialized. Writes are framed
/// on the caller's task and handed to the writer task.
pub struct TcpConnector {
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    queue: OutboundQueue,
    codec: FrameCodec,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl TcpConnector {
    /// Wraps an established stream.
    ///
    /// Must be called within a Tokio runtime: the writer task is spawned
    /// immediately.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the header width is not 2 or 4
    /// - [`Error::Io`] if the socket cannot be prepared
    pub fn new(stream: TcpStream, params: &ConnectorParams) -> Result<Self> {
        let (stream, control) = SocketControl::attach(stream)?;
        Self::with_control(stream, control, params)
    }

    pub(crate) fn with_control(
        stream: TcpStream,
        control: SocketControl,
        params: &ConnectorParams,
    ) -> Result<Self> {
        let codec = FrameCodec::from_params(params)?;
        let local_addr = control.local_addr();
        let remote_addr = control.peer_addr();

        let (read_half, write_half) = stream.into_split();
        let queue = OutboundQueue::spawn(
            StreamSink { half: write_half },
            params.write_queue_cap,
            control,
        );

        debug!(
            local = %local_addr,
            peer = %remote_addr,
            header_width = codec.header_len(),
            max_msg_len = codec.max_len(),
            "TCP connector created"
        );

        Ok(Self {
            reader: Mutex::new(Some(BufReader::new(read_half))),
            queue,
            codec,
            local_addr,
            remote_addr,
        })
    }

    /// Queues pre-encoded bytes as they are, without a length prefix.
    ///
    /// Empty input is ignored. Subject to the same backpressure policy as
    /// [`write_msg`](Connector::write_msg).
    pub fn write_raw(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.queue.push(bytes.to_vec());
        self.release_reader_if_reset();
    }

    /// Returns the framing codec.
    #[inline]
    #[must_use]
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
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
impl Connector for TcpConnector {
    async fn read_msg(&self) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(Error::ConnectionClosed);
        };

        match self.codec.read_frame(reader).await {
            Ok(payload) => Ok(payload),
            Err(e) => {
                *guard = None;
                debug!(peer = %self.remote_addr, error = %e, "TCP read failed, releasing reader");
                Err(e)
            }
        }
    }

    fn write_msg(&self, parts: &[&[u8]]) -> Result<()> {
        let frame = self.codec.encode(parts)?;
        self.queue.push(frame);
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

impl Link for TcpConnector {
    fn control(&self) -> &SocketControl {
        self.queue.control()
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("codec", &self.codec)
            .field("queue_capacity", &self.queue.capacity())
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::protocol::ByteOrder;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn connector(params: &ConnectorParams) -> (TcpConnector, TcpStream) {
        let (local, peer) = pair().await;
        (TcpConnector::new(local, params).unwrap(), peer)
    }

    #[tokio::test]
    async fn test_wire_bytes() {
        let params = ConnectorParams::new().max_msg_len(100);
        let (conn, mut peer) = connector(&params).await;

        conn.write_msg(&[b"hi"]).unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 0x02, 0x68, 0x69]);
    }

    #[tokio::test]
    async fn test_parts_concatenated_little_endian() {
        let params = ConnectorParams::new().header_width(4).byte_order(ByteOrder::Little);
        let (conn, mut peer) = connector(&params).await;

        conn.write_msg(&[b"ab", b"", b"cd"]).unwrap();

        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [4, 0, 0, 0, b'a', b'b', b'c', b'd']);
    }

    #[tokio::test]
    async fn test_too_long_enqueues_nothing() {
        let params = ConnectorParams::new().max_msg_len(10);
        let (conn, _peer) = connector(&params).await;

        let err = conn.write_msg(&[&[0u8; 11]]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { length: 11, max: 10 }));
        assert_eq!(conn.pending_writes(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_read_round_trip() {
        let params = ConnectorParams::default();
        let (a, b) = pair().await;
        let a = TcpConnector::new(a, &params).unwrap();
        let b = TcpConnector::new(b, &params).unwrap();

        a.write_msg(&[b"hello"]).unwrap();
        a.write_msg(&[b"world"]).unwrap();

        assert_eq!(b.read_msg().await.unwrap(), b"hello");
        assert_eq!(b.read_msg().await.unwrap(), b"world");
        assert_eq!(a.remote_addr(), b.local_addr());
    }

    #[tokio::test]
    async fn test_oversized_inbound_releases_reader() {
        let params = ConnectorParams::new().max_msg_len(4);
        let (conn, mut peer) = connector(&params).await;

        peer.write_all(&[0x00, 0x05, 1, 2, 3, 4, 5]).await.unwrap();

        let err = conn.read_msg().await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { length: 5, max: 4 }));

        let err = conn.read_msg().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_flushes_then_eof() {
        let (conn, mut peer) = connector(&ConnectorParams::default()).await;

        conn.write_msg(&[b"a"]).unwrap();
        conn.write_msg(&[b"b"]).unwrap();
        conn.close();
        conn.close();
        conn.write_msg(&[b"late"]).unwrap();
        assert!(conn.is_closed());

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut buf))
            .await
            .expect("peer should see end of stream")
            .unwrap();
        assert_eq!(buf, [0, 1, b'a', 0, 1, b'b']);
    }

    #[tokio::test]
    async fn test_backpressure_destroys() {
        let params = ConnectorParams::new().write_queue_cap(2);
        let (conn, _peer) = connector(&params).await;

        // nothing yields in between: the writer cannot drain
        conn.write_msg(&[b"1"]).unwrap();
        conn.write_msg(&[b"2"]).unwrap();
        conn.write_msg(&[b"3"]).unwrap();
        assert!(conn.is_closed());

        conn.write_msg(&[b"4"]).unwrap();
        assert_eq!(conn.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_destroy_unblocks_reader() {
        let (conn, _peer) = connector(&ConnectorParams::default()).await;
        let conn = std::sync::Arc::new(conn);

        let reader = {
            let conn = std::sync::Arc::clone(&conn);
            tokio::spawn(async move { conn.read_msg().await })
        };
        tokio::task::yield_now().await;

        conn.destroy();
        conn.destroy();

        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader should be woken")
            .unwrap();
        assert!(result.is_err());
        assert!(conn.is_closed());
    }

    async fn peer_read_error(peer: &mut TcpStream) -> std::io::ErrorKind {
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .expect("peer read should finish");
        match read {
            Ok(n) => panic!("peer read {n} bytes instead of a reset"),
            Err(e) => e.kind(),
        }
    }

    #[tokio::test]
    async fn test_destroy_resets_peer() {
        let (conn, mut peer) = connector(&ConnectorParams::default()).await;
        let conn = std::sync::Arc::new(conn);

        conn.write_msg(&[b"discarded"]).unwrap();
        conn.destroy();

        assert_eq!(peer_read_error(&mut peer).await, std::io::ErrorKind::ConnectionReset);
        assert!(matches!(conn.read_msg().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_destroy_during_read_resets_peer() {
        let (conn, mut peer) = connector(&ConnectorParams::default()).await;
        let conn = std::sync::Arc::new(conn);

        let reader = {
            let conn = std::sync::Arc::clone(&conn);
            tokio::spawn(async move { conn.read_msg().await })
        };
        tokio::task::yield_now().await;

        conn.destroy();

        assert_eq!(peer_read_error(&mut peer).await, std::io::ErrorKind::ConnectionReset);
        assert!(reader.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_backpressure_resets_peer() {
        let params = ConnectorParams::new().write_queue_cap(2);
        let (conn, mut peer) = connector(&params).await;

        conn.write_msg(&[b"1"]).unwrap();
        conn.write_msg(&[b"2"]).unwrap();
        conn.write_msg(&[b"3"]).unwrap();

        assert_eq!(peer_read_error(&mut peer).await, std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_write_raw() {
        let (conn, mut peer) = connector(&ConnectorParams::default()).await;

        conn.write_raw(b"");
        conn.write_raw(b"raw");
        conn.close();

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"raw");
    }

    #[tokio::test]
    async fn test_invalid_header_width() {
        let (local, _peer) = pair().await;
        let err = TcpConnector::new(local, &ConnectorParams::new().header_width(3)).unwrap_err();
        assert!(err.is_config_error());
    }
}
