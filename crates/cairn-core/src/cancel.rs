use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CairnError, Result};

/// Cooperative cancellation flag threaded through every public entry point.
///
/// Cloning is cheap; all clones observe the same flag. Backend wrappers check
/// the token at every I/O boundary, the chunker once per chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-progress operations abort at their next check.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Return `Err(Canceled)` if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(CairnError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_live() {
        let t = CancelToken::new();
        assert!(!t.is_canceled());
        assert!(t.check().is_ok());
    }

    #[test]
    fn cancel_propagates_to_clones() {
        let t = CancelToken::new();
        let clone = t.clone();
        t.cancel();
        assert!(clone.is_canceled());
        assert!(matches!(clone.check(), Err(CairnError::Canceled)));
    }
}
