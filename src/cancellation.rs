use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::{PendantDropError, Result};

/// Cooperative cancellation flag shared between an analysis and the
/// thread computing it. Long-running loops poll it at checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    checkpoints: Arc<AtomicUsize>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Number of checkpoints passed so far, by this token and its clones
    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    /// Checkpoint: `Err(Cancelled)` once cancellation was requested
    #[inline]
    pub fn check(&self) -> Result<()> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        if self.is_cancelled() {
            Err(PendantDropError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let worker_copy = token.clone();
        assert!(worker_copy.check().is_ok());

        token.cancel();
        assert!(worker_copy.is_cancelled());
        assert!(matches!(worker_copy.check(), Err(PendantDropError::Cancelled)));
        assert_eq!(token.checkpoints(), 2);
    }
}
