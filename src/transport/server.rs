//! Accept loop shared by the TCP and WebSocket servers.
//!
//! # Connection Flow
//!
//! 1. The accept loop takes a TCP connection from the listener
//! 2. The registry admits it, or it is closed right away when the server is
//!    full or shutting down
//! 3. A handler task establishes the transport (WebSocket upgrade, TLS)
//! 4. The agent factory builds an [`Agent`](crate::Agent) which runs until
//!    the connection ends
//! 5. The connector is closed, the registry entry removed and
//!    `Agent::on_close` called
//!
//! Admission happens before the handshake, so slow or hostile upgrade
//! attempts count towards the connection limit.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::AgentFactory;
use crate::error::Result;
use crate::locker::Locker;

use super::backoff::{AcceptBackoff, is_transient};
use super::registry::{Admission, ConnectionRegistry, Rejection};
use super::socket::SocketControl;
use super::{Connector, Link, signalled};

// ============================================================================
// Acceptor
// ============================================================================

/// Turns an admitted TCP connection into a connector.
#[async_trait]
pub(crate) trait Acceptor: Send + Sync + 'static {
    /// Connector produced for each connection.
    type Conn: Link;

    /// Completes any handshake and builds the connector.
    async fn establish(&self, stream: TcpStream, control: SocketControl)
    -> Result<Arc<Self::Conn>>;
}

// ============================================================================
// ServerCore
// ============================================================================

/// Running server: accept task, registry and shutdown signal.
pub(crate) struct ServerCore {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Sender<bool>,
    accept_task: Locker<Option<JoinHandle<()>>>,
}

impl ServerCore {
    /// Spawns the accept loop over a bound listener.
    pub(crate) fn spawn<A: Acceptor>(
        listener: TcpListener,
        acceptor: A,
        factory: AgentFactory<A::Conn>,
        max_connections: usize,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let registry = ConnectionRegistry::new(max_connections);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(acceptor),
            factory,
            Arc::clone(&registry),
            shutdown_rx,
        ));

        info!(addr = %local_addr, max_connections, "Server listening");

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            accept_task: Locker::new(Some(task)),
        })
    }

    /// Returns the bound listen address.
    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the number of live connections.
    #[inline]
    pub(crate) fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` once close has begun.
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops accepting, closes every live connection and waits for all
    /// handler tasks. Idempotent.
    pub(crate) async fn close(&self) {
        let first = !self.shutdown.send_replace(true);

        let task = self.accept_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
            && e.is_panic()
        {
            error!(error = %e, "Accept task panicked");
        }

        let closed = self.registry.close_all();
        if closed > 0 {
            debug!(count = closed, "Shut down live connections");
        }
        self.registry.wait_idle().await;
        debug_assert!(self.registry.is_empty());

        if first {
            info!(addr = %self.local_addr, "Server closed");
        }
    }
}

impl Drop for ServerCore {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.registry.close_all();
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn accept_loop<A: Acceptor>(
    listener: TcpListener,
    acceptor: Arc<A>,
    factory: AgentFactory<A::Conn>,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = AcceptBackoff::new();

    loop {
        let accepted = tokio::select! {
            biased;
            () = signalled(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => {
                backoff.reset();
                pair
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Accept failed, backing off");
                tokio::select! {
                    biased;
                    () = signalled(&mut shutdown) => break,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
            Err(e) => {
                error!(error = %e, "Accept failed, stopping listener");
                break;
            }
        };

        let (stream, control) = match SocketControl::attach(stream) {
            Ok(attached) => attached,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to prepare accepted socket");
                continue;
            }
        };

        let admission = match registry.admit(control.clone()) {
            Ok(admission) => admission,
            Err(Rejection::Full) => {
                warn!(
                    peer = %peer,
                    max_connections = registry.max_connections(),
                    "Connection limit reached, rejecting"
                );
                continue;
            }
            Err(Rejection::Closed) => break,
        };

        debug!(peer = %peer, conn_id = %admission.id(), "Connection admitted");

        tokio::spawn(handle_connection(
            stream,
            control,
            admission,
            Arc::clone(&acceptor),
            Arc::clone(&factory),
        ));
    }

    debug!("Accept loop finished");
}

// ============================================================================
// Connection Handler
// ============================================================================

async fn handle_connection<A: Acceptor>(
    stream: TcpStream,
    control: SocketControl,
    admission: Admission,
    acceptor: Arc<A>,
    factory: AgentFactory<A::Conn>,
) {
    let peer = control.peer_addr();
    let conn_id = admission.id();

    let conn = match acceptor.establish(stream, control).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(peer = %peer, conn_id = %conn_id, error = %e, "Connection setup failed");
            return;
        }
    };

    info!(peer = %peer, conn_id = %conn_id, "Connection established");

    let mut agent = factory(Arc::clone(&conn));
    agent.run().await;

    conn.close();
    admission.release();
    agent.on_close().await;

    info!(peer = %peer, conn_id = %conn_id, "Connection closed");
    drop(admission);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use crate::agent::{Agent, boxed_factory};
    use crate::config::ConnectorParams;
    use crate::transport::tcp::TcpConnector;

    struct PlainAcceptor;

    #[async_trait]
    impl Acceptor for PlainAcceptor {
        type Conn = TcpConnector;

        async fn establish(
            &self,
            stream: TcpStream,
            control: SocketControl,
        ) -> Result<Arc<TcpConnector>> {
            let conn = TcpConnector::with_control(stream, control, &ConnectorParams::default())?;
            Ok(Arc::new(conn))
        }
    }

    struct Reader {
        conn: Arc<TcpConnector>,
        runs: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for Reader {
        async fn run(&mut self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            while self.conn.read_msg().await.is_ok() {}
        }

        async fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn_server(
        max_connections: usize,
        runs: &Arc<AtomicUsize>,
        closes: &Arc<AtomicUsize>,
    ) -> impl Future<Output = ServerCore> {
        let runs = Arc::clone(runs);
        let closes = Arc::clone(closes);
        async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let factory = boxed_factory(move |conn| Reader {
                conn,
                runs: Arc::clone(&runs),
                closes: Arc::clone(&closes),
            });
            ServerCore::spawn(listener, PlainAcceptor, factory, max_connections).unwrap()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let server = spawn_server(1, &runs, &closes).await;
        let addr = server.local_addr();

        let _first = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 1).await);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("rejected connection should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(server.connection_count(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        server.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let runs = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let server = spawn_server(8, &runs, &closes).await;
        let addr = server.local_addr();

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 2).await);

        tokio::time::timeout(Duration::from_secs(5), server.close())
            .await
            .expect("close should not hang");

        assert_eq!(server.connection_count(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(server.is_closed());
        assert!(TcpStream::connect(addr).await.is_err());

        // idempotent
        server.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peer_disconnect_releases_slot() {
        let runs = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let server = spawn_server(1, &runs, &closes).await;
        let addr = server.local_addr();

        let first = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| server.connection_count() == 1).await);
        drop(first);
        assert!(wait_until(|| closes.load(Ordering::SeqCst) == 1).await);
        assert_eq!(server.connection_count(), 0);

        let _second = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 2).await);

        server.close().await;
    }
}
