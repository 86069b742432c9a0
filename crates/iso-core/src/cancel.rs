use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{IsoError, Result};

/// Cooperative cancellation shared by replay and the connection engine.
///
/// Work loops call `checkpoint` between bounded units of work; nothing is
/// interrupted preemptively.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(IsoError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.checkpoint().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint(), Err(IsoError::Cancelled));
    }
}
