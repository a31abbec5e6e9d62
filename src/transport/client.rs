//! Dial and reconnect loop shared by the TCP and WebSocket clients.
//!
//! ```text
//!         start()
//!            │
//!   Idle ─► Dialing ──dial failed──► sleep interval ─┐
//!            ▲   │                                   │
//!            │   └◄──────────────────────────────────┘
//!            │   │ connected
//!            │   ▼
//!            │ Connected ─► Agent::run ─► close connector ─► Agent::on_close
//!            │                                                   │
//!            └──── sleep interval ◄── auto_reconnect && !closed ─┤
//!                                                                ▼
//!                                                             Closed
//! ```
//!
//! `close()` can interrupt any phase: it shuts the current socket down
//! (unblocking the agent's read) and wakes any dial or sleep.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::AgentFactory;
use crate::error::Result;
use crate::locker::Locker;

use super::{Connector, Link, signalled};
use super::socket::SocketControl;

// ============================================================================
// Dialer
// ============================================================================

/// Establishes one connection to the remote endpoint.
#[async_trait]
pub(crate) trait Dialer: Send + Sync + 'static {
    /// Connector produced by a successful dial.
    type Conn: Link;

    /// Dials once.
    async fn dial(&self) -> Result<Arc<Self::Conn>>;

    /// Remote endpoint, for logging.
    fn target(&self) -> &str;
}

// ============================================================================
// ClientState
// ============================================================================

/// Observable phase of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Between connections.
    Idle,
    /// Dialing or waiting to retry.
    Dialing,
    /// A connection is established and its agent is running.
    Connected,
    /// Closed or finished; the client will not dial again.
    Closed,
}

impl ClientState {
    /// Returns `true` for the terminal state.
    #[inline]
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Reconnect policy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReconnectPolicy {
    pub interval: Duration,
    pub auto_reconnect: bool,
}

// ============================================================================
// Shared State
// ============================================================================

struct ClientInner {
    closed: bool,
    phase: ClientState,
    current: Option<SocketControl>,
}

struct ClientShared {
    inner: Locker<ClientInner>,
    shutdown: watch::Sender<bool>,
    /// Set once the run task has exited, including by panic.
    done: watch::Sender<bool>,
}

impl ClientShared {
    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn set_phase(&self, phase: ClientState) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.phase = phase;
        }
    }

    /// Marks the client closed, shuts down the live socket and wakes the
    /// run task. Returns `false` if already closed.
    fn begin_close(&self) -> bool {
        let current = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            inner.phase = ClientState::Closed;
            inner.current.take()
        };

        if let Some(control) = current {
            control.shutdown();
        }
        self.shutdown.send_replace(true);
        true
    }

    fn finish(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.phase = ClientState::Closed;
            inner.current = None;
        }
        self.done.send_replace(true);
    }
}

/// Finishes the client when the run task exits or unwinds.
struct FinishGuard(Arc<ClientShared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

// ============================================================================
// ClientCore
// ============================================================================

/// Running client: owns the run task and its shared state.
pub(crate) struct ClientCore {
    shared: Arc<ClientShared>,
    task: Locker<Option<JoinHandle<()>>>,
}

impl ClientCore {
    /// Spawns the run task.
    pub(crate) fn spawn<D: Dialer>(
        dialer: D,
        factory: AgentFactory<D::Conn>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            inner: Locker::new(ClientInner {
                closed: false,
                phase: ClientState::Idle,
                current: None,
            }),
            shutdown,
            done,
        });

        let task = tokio::spawn(run_client(dialer, factory, policy, Arc::clone(&shared)));

        Self {
            shared,
            task: Locker::new(Some(task)),
        }
    }

    /// Returns the current phase.
    pub(crate) fn state(&self) -> ClientState {
        self.shared.inner.lock().phase
    }

    /// Returns `true` once the client is closed or finished.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the client and waits for the run task to exit. Idempotent.
    ///
    /// Every caller waits, not only the one that takes the task handle.
    pub(crate) async fn close(&self) {
        if self.shared.begin_close() {
            debug!("Client closing");
        }

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
            && e.is_panic()
        {
            error!(error = %e, "Client task panicked");
        }

        let mut done = self.shared.done.subscribe();
        // the sender lives in `shared`, so this only fails if it was dropped
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.shared.begin_close();
    }
}

// ============================================================================
// Run Task
// ============================================================================

async fn run_client<D: Dialer>(
    dialer: D,
    factory: AgentFactory<D::Conn>,
    policy: ReconnectPolicy,
    shared: Arc<ClientShared>,
) {
    let _finish = FinishGuard(Arc::clone(&shared));
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        let Some(conn) = dial(&dialer, policy.interval, &shared, &mut shutdown).await else {
            break;
        };

        {
            let mut inner = shared.inner.lock();
            if inner.closed {
                drop(inner);
                debug!(addr = %dialer.target(), "Client closed while dialing, discarding connection");
                conn.destroy();
                break;
            }
            inner.current = Some(conn.control().clone());
            inner.phase = ClientState::Connected;
        }

        info!(
            addr = %conn.remote_addr(),
            local = %conn.local_addr(),
            "Connected"
        );

        let mut agent = factory(Arc::clone(&conn));
        agent.run().await;

        conn.close();
        {
            let mut inner = shared.inner.lock();
            inner.current = None;
            if !inner.closed {
                inner.phase = ClientState::Idle;
            }
        }
        agent.on_close().await;

        info!(addr = %conn.remote_addr(), "Disconnected");
        drop(conn);

        let reconnect = policy.auto_reconnect && !shared.is_closed();
        if !reconnect {
            break;
        }
        if !pause(policy.interval, &mut shutdown).await {
            break;
        }
    }

    debug!(addr = %dialer.target(), "Client task finished");
}

/// Dials until connected. Returns `None` once the client is closed.
async fn dial<D: Dialer>(
    dialer: &D,
    interval: Duration,
    shared: &ClientShared,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Arc<D::Conn>> {
    loop {
        if shared.is_closed() {
            return None;
        }
        shared.set_phase(ClientState::Dialing);

        let dialed = tokio::select! {
            biased;
            () = signalled(shutdown) => return None,
            dialed = dialer.dial() => dialed,
        };

        match dialed {
            Ok(conn) => return Some(conn),
            Err(e) => {
                warn!(
                    addr = %dialer.target(),
                    error = %e,
                    retry_ms = interval.as_millis() as u64,
                    "Dial failed"
                );
                if !pause(interval, shutdown).await {
                    return None;
                }
            }
        }
    }
}

/// Sleeps `interval`. Returns `false` if woken by close.
async fn pause(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        () = signalled(shutdown) => false,
        () = tokio::time::sleep(interval) => true,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::{TcpListener, TcpStream};

    use crate::agent::{Agent, boxed_factory};
    use crate::config::ConnectorParams;
    use crate::transport::tcp::TcpConnector;

    /// Dials a TCP address, counting attempts.
    struct CountingDialer {
        addr: String,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        type Conn = TcpConnector;

        async fn dial(&self) -> Result<Arc<TcpConnector>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let stream = TcpStream::connect(&self.addr).await?;
            let (stream, control) = SocketControl::attach(stream)?;
            let conn = TcpConnector::with_control(stream, control, &ConnectorParams::default())?;
            Ok(Arc::new(conn))
        }

        fn target(&self) -> &str {
            &self.addr
        }
    }

    /// Agent reading until the connection fails.
    struct Reader {
        conn: Arc<TcpConnector>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for Reader {
        async fn run(&mut self) {
            while self.conn.read_msg().await.is_ok() {}
        }

        async fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reader_factory(closes: &Arc<AtomicUsize>) -> AgentFactory<TcpConnector> {
        let closes = Arc::clone(closes);
        boxed_factory(move |conn| Reader {
            conn,
            closes: Arc::clone(&closes),
        })
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_retries_until_closed() {
        let addr = unused_addr().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let client = ClientCore::spawn(
            CountingDialer {
                addr: addr.to_string(),
                attempts: Arc::clone(&attempts),
            },
            reader_factory(&closes),
            ReconnectPolicy {
                interval: Duration::from_millis(20),
                auto_reconnect: false,
            },
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(client.state(), ClientState::Dialing);

        tokio::time::timeout(Duration::from_secs(5), client.close())
            .await
            .expect("close should not hang");
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let closes = Arc::new(AtomicUsize::new(0));

        let client = ClientCore::spawn(
            CountingDialer {
                addr: addr.to_string(),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            reader_factory(&closes),
            ReconnectPolicy {
                interval: Duration::from_millis(20),
                auto_reconnect: true,
            },
        );

        let (_peer, _) = listener.accept().await.unwrap();
        for _ in 0..100 {
            if client.state() == ClientState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.state(), ClientState::Connected);

        tokio::time::timeout(Duration::from_secs(5), client.close())
            .await
            .expect("close should not hang");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(client.is_closed());

        // idempotent
        client.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_reconnect_finishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let client = ClientCore::spawn(
            CountingDialer {
                addr: addr.to_string(),
                attempts: Arc::clone(&attempts),
            },
            reader_factory(&closes),
            ReconnectPolicy {
                interval: Duration::from_millis(20),
                auto_reconnect: false,
            },
        );

        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        for _ in 0..200 {
            if client.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.is_closed());
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        client.close().await;
    }

    /// Agent whose `on_close` takes a while before recording completion.
    struct SlowClose {
        conn: Arc<TcpConnector>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for SlowClose {
        async fn run(&mut self) {
            while self.conn.read_msg().await.is_ok() {}
        }

        async fn on_close(&mut self) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_concurrent_close_waits_for_task() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        let agent_finished = Arc::clone(&finished);
        let client = ClientCore::spawn(
            CountingDialer {
                addr: addr.to_string(),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            boxed_factory(move |conn| SlowClose {
                conn,
                finished: Arc::clone(&agent_finished),
            }),
            ReconnectPolicy {
                interval: Duration::from_millis(20),
                auto_reconnect: true,
            },
        );

        let (_peer, _) = listener.accept().await.unwrap();
        for _ in 0..100 {
            if client.state() == ClientState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.state(), ClientState::Connected);

        let first = async {
            client.close().await;
            finished.load(Ordering::SeqCst)
        };
        let second = async {
            client.close().await;
            finished.load(Ordering::SeqCst)
        };
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(first, second)
        })
        .await
        .expect("close should not hang");

        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }

    #[test]
    fn test_state_terminal() {
        assert!(ClientState::Closed.is_closed());
        assert!(!ClientState::Dialing.is_closed());
    }
}
