//! Live connection set of a server.
//!
//! The registry enforces the connection cap at accept time and lets
//! `close()` shut every live connection down and wait for all handler tasks.
//!
//! Each admitted connection gets an [`Admission`]. Dropping it removes the
//! entry, so a handler that panics still releases its slot. Admissions also
//! act as a wait group: [`ConnectionRegistry::wait_idle`] returns once the
//! registry is closed and every admission is gone.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::socket::SocketControl;

// ============================================================================
// Types
// ============================================================================

/// Why a connection was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// The live count is at the maximum.
    Full,
    /// The server is shutting down.
    Closed,
}

struct RegistryState {
    live: FxHashMap<Uuid, SocketControl>,
    closed: bool,
    tracker: Option<mpsc::Sender<()>>,
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Bounded set of live connections.
pub(crate) struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    max_connections: usize,
    idle: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry admitting up to `max_connections`.
    pub(crate) fn new(max_connections: usize) -> Arc<Self> {
        let (tracker, idle) = mpsc::channel(1);
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                live: FxHashMap::default(),
                closed: false,
                tracker: Some(tracker),
            }),
            max_connections,
            idle: tokio::sync::Mutex::new(idle),
        })
    }

    /// Registers a connection if there is room.
    pub(crate) fn admit(
        self: &Arc<Self>,
        control: SocketControl,
    ) -> std::result::Result<Admission, Rejection> {
        let mut state = self.state.lock();

        let Some(tracker) = state.tracker.clone() else {
            return Err(Rejection::Closed);
        };
        if state.closed {
            return Err(Rejection::Closed);
        }
        if state.live.len() >= self.max_connections {
            return Err(Rejection::Full);
        }

        let id = Uuid::new_v4();
        state.live.insert(id, control);

        Ok(Admission {
            registry: Arc::clone(self),
            id,
            _tracker: tracker,
        })
    }

    /// Returns the number of live connections.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Returns `true` if no connection is live.
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the admission limit.
    pub(crate) fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Stops admitting, shuts down every live connection and clears the set.
    ///
    /// Returns the number of connections shut down.
    pub(crate) fn close_all(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        state.tracker = None;

        let count = state.live.len();
        for (id, control) in state.live.drain() {
            control.shutdown();
            debug!(conn_id = %id, peer = %control.peer_addr(), "Connection closed during shutdown");
        }
        count
    }

    /// Waits until the registry is closed and every admission is dropped.
    pub(crate) async fn wait_idle(&self) {
        let mut idle = self.idle.lock().await;
        while idle.recv().await.is_some() {}
    }

    fn release(&self, id: &Uuid) {
        self.state.lock().live.remove(id);
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Slot held by one admitted connection. Releases it on drop.
pub(crate) struct Admission {
    registry: Arc<ConnectionRegistry>,
    id: Uuid,
    _tracker: mpsc::Sender<()>,
}

impl Admission {
    /// Returns the connection id.
    #[inline]
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Removes the connection from the live set.
    ///
    /// The handler keeps counting towards [`ConnectionRegistry::wait_idle`]
    /// until the admission is dropped.
    pub(crate) fn release(&self) {
        self.registry.release(&self.id);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry.release(&self.id);
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
    use tokio::net::{TcpListener, TcpStream};

    async fn control() -> (SocketControl, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_client, control) = SocketControl::attach(client.unwrap()).unwrap();
        (control, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_admit_up_to_max() {
        let registry = ConnectionRegistry::new(2);
        let (c1, _p1) = control().await;
        let (c2, _p2) = control().await;
        let (c3, _p3) = control().await;

        let a1 = registry.admit(c1).expect("first admitted");
        let _a2 = registry.admit(c2).expect("second admitted");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.admit(c3.clone()).err(), Some(Rejection::Full));

        drop(a1);
        assert_eq!(registry.len(), 1);
        assert!(registry.admit(c3).is_ok());
    }

    #[tokio::test]
    async fn test_release_keeps_tracking() {
        let registry = ConnectionRegistry::new(1);
        let (c1, _p1) = control().await;

        let admission = registry.admit(c1).unwrap();
        admission.release();
        assert!(registry.is_empty());

        registry.close_all();
        let idle = tokio::time::timeout(Duration::from_millis(30), registry.wait_idle()).await;
        assert!(idle.is_err(), "released admission still counts until dropped");

        drop(admission);
        registry.wait_idle().await;
    }

    #[tokio::test]
    async fn test_admission_ids_unique() {
        let registry = ConnectionRegistry::new(4);
        let (c1, _p1) = control().await;
        let (c2, _p2) = control().await;

        let a1 = registry.admit(c1).unwrap();
        let a2 = registry.admit(c2).unwrap();
        assert_ne!(a1.id(), a2.id());
    }

    #[tokio::test]
    async fn test_close_all_shuts_down_and_rejects() {
        let registry = ConnectionRegistry::new(4);
        let (c1, mut peer) = control().await;
        let (c2, _p2) = control().await;

        let admission = registry.admit(c1).unwrap();
        assert_eq!(registry.close_all(), 1);
        assert!(registry.is_empty());
        assert_eq!(registry.admit(c2).err(), Some(Rejection::Closed));

        let mut buf = [0u8; 4];
        let read = peer.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);

        drop(admission);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_admissions() {
        let registry = ConnectionRegistry::new(4);
        let (c1, _p1) = control().await;
        let admission = registry.admit(c1).unwrap();

        registry.close_all();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(admission);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait_idle should return")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_twice() {
        let registry = ConnectionRegistry::new(1);
        registry.close_all();
        registry.wait_idle().await;
        registry.wait_idle().await;
        assert_eq!(registry.max_connections(), 1);
    }
}
