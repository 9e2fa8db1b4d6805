use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Iterations left across all workers of a campaign.
#[derive(Debug, Clone)]
pub struct IterationCounter {
    total: usize,
    remaining: Arc<AtomicUsize>,
}

impl IterationCounter {
    pub fn new(iterations: usize) -> Self {
        Self {
            total: iterations,
            remaining: Arc::new(AtomicUsize::new(iterations)),
        }
    }

    /// Claims one iteration and returns its number, `None` once none are left.
    pub fn take(&self) -> Option<usize> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|previous| self.total - previous)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

/// Operator interrupt flag, set from the Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns [`crate::error::Error::Cancelled`] once cancelled.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            return Err(crate::error::Error::Cancelled);
        }
        Ok(())
    }
}
