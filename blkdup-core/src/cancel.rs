use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shared flag for cooperative cancellation.
///
/// Clones share the same flag. The copier and the hasher poll it between
/// blocks, so an in-flight block always completes before the operation stops.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Safe to call from a signal handler thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
