use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Cancellation-and-priority token attached to a request.
///
/// Clones share state, so the requester can keep one clone to abort or
/// re-prioritise a request that is still waiting in the queue. The token is
/// only consulted when dispatch is attempted; a request already handed to a
/// worker is unaffected by a later `abort`.
#[derive(Debug, Clone, Default)]
pub struct RequestToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    aborted: AtomicBool,
    priority: AtomicI64,
}

impl RequestToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(priority: i64) -> Self {
        let token = Self::default();
        token.set_priority(priority);
        token
    }

    /// Higher values are dispatched first. Zero means "not prioritised".
    pub fn priority(&self) -> i64 {
        self.inner.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i64) {
        self.inner.priority.store(priority, Ordering::Relaxed);
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }
}
