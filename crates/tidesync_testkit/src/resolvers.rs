//! Resolvers for observing conflict handling.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tidesync_core::{ConflictResolver, CoreError, CoreResult, LastWriterWins, StoredObject};

/// Wraps another resolver and counts how often it is invoked.
#[derive(Clone)]
pub struct CountingResolver {
    inner: Arc<dyn ConflictResolver>,
    merges: Arc<AtomicUsize>,
}

impl CountingResolver {
    /// Counts around [`LastWriterWins`].
    pub fn new() -> Self {
        Self::wrapping(Arc::new(LastWriterWins))
    }

    /// Counts around `inner`.
    pub fn wrapping(inner: Arc<dyn ConflictResolver>) -> Self {
        Self {
            inner,
            merges: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of merges so far.
    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    /// Resets the counter.
    pub fn reset(&self) {
        self.merges.store(0, Ordering::SeqCst);
    }
}

impl Default for CountingResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver for CountingResolver {
    fn merge(
        &self,
        local: &StoredObject,
        remote: &StoredObject,
        type_name: &str,
    ) -> CoreResult<StoredObject> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        self.inner.merge(local, remote, type_name)
    }
}

impl std::fmt::Debug for CountingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingResolver")
            .field("merges", &self.merges())
            .finish()
    }
}

/// Fails a fixed number of merges, then defers to [`LastWriterWins`].
#[derive(Debug, Clone)]
pub struct FailingResolver {
    remaining: Arc<AtomicUsize>,
    transient: bool,
}

impl FailingResolver {
    /// Fails the next `times` merges with an error worth retrying.
    pub fn transient(times: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(times)),
            transient: true,
        }
    }

    /// Refuses the next `times` merges.
    pub fn rejecting(times: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(times)),
            transient: false,
        }
    }

    /// Failures still to come.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

impl ConflictResolver for FailingResolver {
    fn merge(
        &self,
        local: &StoredObject,
        remote: &StoredObject,
        type_name: &str,
    ) -> CoreResult<StoredObject> {
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !fail {
            return LastWriterWins.merge(local, remote, type_name);
        }
        if self.transient {
            Err(CoreError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "resolver busy",
            )))
        } else {
            Err(CoreError::conflict_policy(format!("refusing to merge {}", local.key)))
        }
    }
}
