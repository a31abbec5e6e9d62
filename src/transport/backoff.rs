//! Backoff for transient accept errors.
//!
//! Running out of file descriptors or an aborted handshake must not kill the
//! accept loop. The loop sleeps 5 ms after the first such error, doubling up
//! to one second, and resets after the next successful accept.

use std::io;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

const INITIAL_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// AcceptBackoff
// ============================================================================

/// Exponential delay between failed accepts.
#[derive(Debug, Default)]
pub(crate) struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    #[inline]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the delay before the next accept and advances the sequence.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.delay {
            None => INITIAL_DELAY,
            Some(prev) => (prev * 2).min(MAX_DELAY),
        };
        self.delay = Some(delay);
        delay
    }

    /// Restarts the sequence after a successful accept.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.delay = None;
    }
}

// ============================================================================
// Error Classification
// ============================================================================

/// Returns `true` if the accept loop should retry after `err`.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
            | TimedOut | OutOfMemory
    ) {
        return true;
    }

    is_resource_exhausted(err)
}

/// Descriptor and buffer exhaustion carry no dedicated `ErrorKind`.
#[cfg(unix)]
fn is_resource_exhausted(err: &io::Error) -> bool {
    use libc::{EMFILE, ENFILE, ENOBUFS, ENOMEM};

    matches!(err.raw_os_error(), Some(EMFILE | ENFILE | ENOMEM | ENOBUFS))
}

#[cfg(not(unix))]
fn is_resource_exhausted(_err: &io::Error) -> bool {
    false
}

// ============================================================================
// Tests
// ============================================================================
