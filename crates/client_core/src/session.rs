use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use shared::domain::SessionId;

/// Issues session generations and answers "is this generation still live".
///
/// Cloning shares the same counters, so the connection manager and every
/// dependent see one source of truth.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    issued: AtomicU64,
    current: AtomicU64,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh generation and makes it current. Any older
    /// generation becomes stale.
    pub fn begin(&self) -> SessionId {
        let id = self.inner.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.current.store(id, Ordering::SeqCst);
        SessionId(id)
    }

    pub fn current(&self) -> Option<SessionId> {
        match self.inner.current.load(Ordering::SeqCst) {
            0 => None,
            id => Some(SessionId(id)),
        }
    }

    pub fn is_current(&self, id: SessionId) -> bool {
        id.0 != 0 && self.inner.current.load(Ordering::SeqCst) == id.0
    }

    /// Ends `id` if it is still current. Returns whether anything changed.
    pub fn invalidate(&self, id: SessionId) -> bool {
        self.inner
            .current
            .compare_exchange(id.0, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn invalidate_all(&self) {
        self.inner.current.store(0, Ordering::SeqCst);
    }
}

/// One confirmed connected lifetime of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub sid: String,
}
