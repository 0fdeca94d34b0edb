//! Coordination with a background persistence task.
//!
//! Emulator frontends typically write autosaves from another thread, reading the same
//! machine memory the core is stepping. A [`PersistenceLock`] shared between the session
//! and that task keeps the two apart: the session acquires it around every individual
//! simulation step it drives during resimulation, and releases it before the next one, so
//! an autosave can slip in between replayed frames instead of waiting for the whole replay.
//!
//! ```
//! use delta_rollback::PersistenceLock;
//!
//! let lock = PersistenceLock::new();
//! let autosave_side = lock.clone();
//!
//! {
//!     let _guard = lock.acquire();
//!     // step the simulation
//! }
//! let _guard = autosave_side.acquire();
//! ```

use crate::sync::{Arc, Mutex, MutexGuard};

/// A clonable handle to a lock shared with a persistence task.
#[derive(Clone, Default)]
pub struct PersistenceLock {
    inner: Arc<Mutex<()>>,
}

impl PersistenceLock {
    /// Creates a new, unlocked persistence lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is available and returns a guard that releases it on drop.
    #[cfg(not(loom))]
    #[must_use = "the lock is released as soon as the guard is dropped"]
    pub fn acquire(&self) -> PersistenceGuard<'_> {
        PersistenceGuard {
            _guard: self.inner.lock(),
        }
    }

    /// Blocks until the lock is available and returns a guard that releases it on drop.
    #[cfg(loom)]
    #[must_use = "the lock is released as soon as the guard is dropped"]
    pub fn acquire(&self) -> PersistenceGuard<'_> {
        // the mutex guards no data, so a poisoned lock is still usable
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        PersistenceGuard { _guard: guard }
    }

    /// Returns `true` if some handle currently holds the lock.
    #[cfg(not(loom))]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }
}

impl std::fmt::Debug for PersistenceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("PersistenceLock");
        #[cfg(not(loom))]
        s.field("held", &self.is_held());
        s.finish_non_exhaustive()
    }
}

/// RAII guard returned by [`PersistenceLock::acquire`].
pub struct PersistenceGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for PersistenceGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGuard").finish_non_exhaustive()
    }
}
