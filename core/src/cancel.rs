//! Cancellation for indexing passes.
//!
//! A [`CancelSource`] hands out tokens stamped with its current version.
//! `cancel()` bumps the version, which cancels every token handed out before
//! the bump while tokens taken afterwards start out live.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct CancelSource {
    active_version: Arc<AtomicU64>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that stays live until the next [`CancelSource::cancel`].
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            active_version: Some(self.active_version.clone()),
            version: self.active_version.load(Ordering::SeqCst),
        }
    }

    /// Cancels all outstanding tokens.
    pub fn cancel(&self) {
        self.active_version.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct CancellationToken {
    active_version: Option<Arc<AtomicU64>>,
    version: u64,
}

impl CancellationToken {
    /// Creates a cancellation token that is never cancelled.
    pub fn noop() -> Self {
        Self { active_version: None, version: 0 }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.active_version {
            Some(active) => active.load(Ordering::Relaxed) != self.version,
            None => false,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_token_is_never_cancelled() {
        assert!(!CancellationToken::noop().is_cancelled());
        assert!(!CancellationToken::default().is_cancelled());
    }

    #[test]
    fn cancel_only_affects_earlier_tokens() {
        let source = CancelSource::new();
        let before = source.token();
        source.cancel();
        let after = source.token();
        assert!(before.is_cancelled());
        assert!(!after.is_cancelled());
    }
}
