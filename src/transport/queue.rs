//! Outbound write queue and its writer task.
//!
//! Every connector owns one bounded FIFO queue and one writer task draining
//! it into the transport. Producers never write to the socket themselves.
//!
//! ```text
//! write_msg ─┐
//! write_msg ─┼─► OutboundQueue (bounded) ─► writer task ─► transport
//! close     ─┘         Frame … Frame Stop
//! ```
//!
//! # Backpressure
//!
//! A push that finds the queue full means the peer is not draining fast
//! enough. The queue is then destroyed: the socket is reset and pending
//! frames are discarded. Producers are never blocked and frames are never
//! dropped silently while the connection stays up.
//!
//! # Shutdown
//!
//! - [`OutboundQueue::close`] enqueues a stop marker; the writer flushes
//!   everything before it, finishes the transport and shuts the socket down.
//! - [`OutboundQueue::destroy`] resets the socket and wakes the writer,
//!   which exits without draining.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::locker::Locker;

use super::socket::SocketControl;

// ============================================================================
// FrameSink
// ============================================================================

/// Write side of a transport, owned by the writer task.
#[async_trait]
pub(crate) trait FrameSink: Send + 'static {
    /// Writes one encoded message.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Finishes the write side after the last frame.
    async fn finish(&mut self);

    /// Drops the sink after a reset without signalling end of stream.
    fn abort(self)
    where
        Self: Sized,
    {
    }
}

// ============================================================================
// Types
// ============================================================================

/// Queue entry.
#[derive(Debug)]
enum Outbound {
    /// Encoded message.
    Frame(Vec<u8>),
    /// Stop after everything queued before it.
    Stop,
}

/// Why the writer task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
    Drained,
    WriteFailed,
    Aborted,
}

/// Lifecycle state guarded by the [`Locker`].
struct QueueState {
    closed: bool,
    tx: Option<mpsc::Sender<Outbound>>,
}

/// State shared between the queue handle and its writer task.
struct Shared {
    state: Locker<QueueState>,
    abort: Notify,
    control: SocketControl,
}

// ============================================================================
// OutboundQueue
// ============================================================================

/// Bounded outbound queue of one connection.
pub(crate) struct OutboundQueue {
    shared: Arc<Shared>,
    capacity: usize,
}

impl OutboundQueue {
    /// Creates the queue and spawns its writer task over `sink`.
    ///
    /// `capacity` is raised to 1 if zero.
    pub(crate) fn spawn<W: FrameSink>(sink: W, capacity: usize, control: SocketControl) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let shared = Arc::new(Shared {
            state: Locker::new(QueueState {
                closed: false,
                tx: Some(tx),
            }),
            abort: Notify::new(),
            control,
        });

        tokio::spawn(run_writer(sink, rx, Arc::clone(&shared)));

        Self { shared, capacity }
    }

    /// Enqueues an encoded message.
    ///
    /// No-op once the queue is closed. Destroys the queue if it is full.
    pub(crate) fn push(&self, frame: Vec<u8>) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        self.enqueue(&mut state, Outbound::Frame(frame));
    }

    /// Requests a graceful close: queued frames are flushed first.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        self.enqueue(&mut state, Outbound::Stop);
        state.closed = true;
    }

    /// Resets the transport and discards queued frames.
    pub(crate) fn destroy(&self) {
        let mut state = self.shared.state.lock();
        self.destroy_locked(&mut state);
    }

    /// Returns `true` once close or destroy has begun or the writer exited.
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Returns the number of frames waiting for the writer.
    pub(crate) fn pending(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .tx
            .as_ref()
            .map_or(0, |tx| self.capacity - tx.capacity())
    }

    /// Returns the queue capacity.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the socket control handle.
    #[inline]
    pub(crate) fn control(&self) -> &SocketControl {
        &self.shared.control
    }

    fn enqueue(&self, state: &mut QueueState, item: Outbound) {
        let Some(tx) = state.tx.as_ref() else {
            return;
        };

        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    peer = %self.peer_addr(),
                    capacity = self.capacity,
                    "Outbound queue full, destroying connection"
                );
                self.destroy_locked(state);
            }
            Err(TrySendError::Closed(_)) => {
                // writer already gone
                state.closed = true;
                state.tx = None;
            }
        }
    }

    fn destroy_locked(&self, state: &mut QueueState) {
        self.shared.control.reset();
        state.closed = true;
        if state.tx.take().is_some() {
            self.shared.abort.notify_one();
            debug!(peer = %self.peer_addr(), "Connection destroyed");
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.shared.control.peer_addr()
    }
}

// ============================================================================
// Writer Task
// ============================================================================

/// Drains the queue into `sink` until stop, write error or abort.
async fn run_writer<W: FrameSink>(
    mut sink: W,
    mut rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
) {
    let exit = loop {
        let item = tokio::select! {
            biased;
            () = shared.abort.notified() => break WriterExit::Aborted,
            item = rx.recv() => item,
        };

        match item {
            Some(Outbound::Frame(frame)) => {
                let len = frame.len();
                let written = tokio::select! {
                    biased;
                    () = shared.abort.notified() => break WriterExit::Aborted,
                    written = sink.send_frame(frame) => written,
                };

                if let Err(e) = written {
                    debug!(error = %e, peer = %shared.control.peer_addr(), "Write failed");
                    break WriterExit::WriteFailed;
                }
                trace!(len, "Frame written");
            }
            Some(Outbound::Stop) => break WriterExit::Drained,
            // every sender dropped: destroyed
            None => break WriterExit::Aborted,
        }
    };

    if exit == WriterExit::Drained {
        tokio::select! {
            biased;
            () = shared.abort.notified() => {}
            () = sink.finish() => {}
        }
    }

    if exit != WriterExit::Aborted {
        shared.control.shutdown();
    }

    rx.close();
    if exit == WriterExit::Aborted {
        sink.abort();
    } else {
        drop(sink);
    }

    {
        let mut state = shared.state.lock();
        state.closed = true;
        state.tx = None;
    }

    debug!(?exit, peer = %shared.control.peer_addr(), "Writer task finished");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::UnboundedSender;

    use crate::error::Error;

    /// Sink recording frames into a channel.
    struct RecordingSink {
        frames: UnboundedSender<Vec<u8>>,
        finished: Arc<Notify>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
            self.frames.send(frame).map_err(|_| Error::ConnectionClosed)
        }

        async fn finish(&mut self) {
            self.finished.notify_one();
        }
    }

    /// Sink that never completes a write.
    struct StuckSink {
        dropped: Arc<Notify>,
    }

    #[async_trait]
    impl FrameSink for StuckSink {
        async fn send_frame(&mut self, _frame: Vec<u8>) -> Result<()> {
            std::future::pending().await
        }

        async fn finish(&mut self) {}
    }

    impl Drop for StuckSink {
        fn drop(&mut self) {
            self.dropped.notify_one();
        }
    }

    async fn control() -> (SocketControl, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_client, control) = SocketControl::attach(client.unwrap()).unwrap();
        (control, accepted.unwrap().0)
    }

    fn recording() -> (
        RecordingSink,
        tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        Arc<Notify>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let finished = Arc::new(Notify::new());
        let sink = RecordingSink {
            frames: tx,
            finished: Arc::clone(&finished),
        };
        (sink, rx, finished)
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (control, _peer) = control().await;
        let (sink, mut frames, finished) = recording();
        let queue = OutboundQueue::spawn(sink, 8, control);

        queue.push(b"one".to_vec());
        queue.push(b"two".to_vec());
        queue.push(b"three".to_vec());
        queue.close();

        assert_eq!(frames.recv().await.unwrap(), b"one");
        assert_eq!(frames.recv().await.unwrap(), b"two");
        assert_eq!(frames.recv().await.unwrap(), b"three");

        tokio::time::timeout(Duration::from_secs(5), finished.notified())
            .await
            .expect("sink should be finished after stop");
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_push_after_close_is_noop() {
        let (control, _peer) = control().await;
        let (sink, mut frames, _finished) = recording();
        let queue = OutboundQueue::spawn(sink, 8, control);

        queue.close();
        queue.close();
        queue.push(b"late".to_vec());

        assert!(frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_destroys() {
        let (control, _peer) = control().await;
        let (sink, _frames, _finished) = recording();
        let queue = OutboundQueue::spawn(sink, 2, control);

        // current-thread runtime: the writer cannot drain before we yield
        queue.push(b"a".to_vec());
        queue.push(b"b".to_vec());
        assert_eq!(queue.pending(), 2);
        assert!(!queue.is_closed());

        queue.push(b"c".to_vec());
        assert!(queue.is_closed());
        assert_eq!(queue.pending(), 0);

        queue.push(b"d".to_vec());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_destroy_discards_pending() {
        let (control, _peer) = control().await;
        let (sink, mut frames, finished) = recording();
        let queue = OutboundQueue::spawn(sink, 8, control);

        queue.push(b"a".to_vec());
        queue.push(b"b".to_vec());
        queue.destroy();
        queue.destroy();

        assert!(frames.recv().await.is_none());
        assert!(queue.is_closed());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), finished.notified())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_destroy_interrupts_stuck_write() {
        let (control, _peer) = control().await;
        let dropped = Arc::new(Notify::new());
        let sink = StuckSink {
            dropped: Arc::clone(&dropped),
        };
        let queue = OutboundQueue::spawn(sink, 4, control);

        queue.push(b"never".to_vec());
        tokio::task::yield_now().await;
        queue.destroy();

        tokio::time::timeout(Duration::from_secs(5), dropped.notified())
            .await
            .expect("writer should exit and drop its sink");
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_zero_capacity_raised() {
        let (control, _peer) = control().await;
        let (sink, _frames, _finished) = recording();
        let queue = OutboundQueue::spawn(sink, 0, control);
        assert_eq!(queue.capacity(), 1);
    }
}
