//! Lifecycle state guard.
//!
//! [`Locker`] serializes lifecycle transitions of connectors and clients
//! (closed flags, stored transport handles, queue senders). It is a real
//! mutual-exclusion primitive: concurrent `lock()` callers wait for each
//! other. Critical sections are short and never held across an `.await`.
//!
//! [`Locker::try_lock`] covers the best-effort case where a caller would
//! rather skip a transition than wait for it.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::{Mutex, MutexGuard};

// ============================================================================
// Types
// ============================================================================

/// Guard returned by [`Locker::lock`]. Unlocks on drop.
pub type LockerGuard<'a, T> = MutexGuard<'a, T>;

// ============================================================================
// Locker
// ============================================================================

/// Guard around a piece of lifecycle state.
pub struct Locker<T> {
    state: Mutex<T>,
}

impl<T> Locker<T> {
    /// Creates a new unlocked guard around `state`.
    #[inline]
    #[must_use]
    pub const fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Locks the state, waiting for any other holder to unlock.
    #[inline]
    pub fn lock(&self) -> LockerGuard<'_, T> {
        self.state.lock()
    }

    /// Locks the state only if nobody else holds it.
    #[inline]
    pub fn try_lock(&self) -> Option<LockerGuard<'_, T>> {
        self.state.try_lock()
    }

    /// Returns `true` if the state is currently locked.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }
}

impl<T: Default> Default for Locker<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Locker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker")
            .field("locked", &self.is_locked())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
