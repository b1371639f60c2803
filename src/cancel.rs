//! Cancellation tokens and deadlines (§4.7).
//!
//! A cancellation token is a shared atomic trigger. Suspension points poll
//! it and return [`crate::error::Code::Cancelled`] once it has fired. Tokens
//! may be chained so that a child observes cancellation whenever its parent
//! does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Inner {
    fired: AtomicBool,
    parent: Option<CancelToken>,
}

/// A shared, cloneable cancellation trigger.
///
/// Cloning shares the same underlying flag (and parent chain); it does not
/// create an independent token. Use [`CancelToken::child`] to chain.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A fresh, unfired, unparented token.
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// A token that is considered fired as soon as `self` or `parent` fires.
    pub fn child(parent: &CancelToken) -> CancelToken {
        CancelToken {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                parent: Some(parent.clone()),
            }),
        }
    }

    /// Set the trigger. Idempotent: firing an already-fired token is a
    /// no-op. Does not affect the parent.
    pub fn trigger(&self) {
        self.inner.fired.store(true, Ordering::Release);
    }

    /// True if this token or any ancestor in its chain has fired.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.fired.load(Ordering::Acquire) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// An absolute point in time on the monotonic clock, derived from a bounded
/// timeout as early as possible so retries and yields don't extend the wait
/// (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    /// Convert one of the three timeout regimes (§4.4 "Common semantics")
    /// into an optional absolute deadline. `None` represents either `try`
    /// (timeout == 0, handled by the caller before reaching a deadline
    /// check) or `infinite` (timeout < 0).
    pub fn from_timeout_ms(timeout_ms: i64) -> Option<Deadline> {
        if timeout_ms > 0 {
            Some(Deadline(Instant::now() + Duration::from_millis(timeout_ms as u64)))
        } else {
            None
        }
    }

    pub fn has_elapsed(&self) -> bool {
        Instant::now() >= self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_observed() {
        let tok = CancelToken::new();
        assert!(!tok.is_cancelled());
        tok.trigger();
        assert!(tok.is_cancelled());
    }

    #[test]
    fn child_observes_parent_trigger() {
        let parent = CancelToken::new();
        let child = CancelToken::child(&parent);
        assert!(!child.is_cancelled());
        parent.trigger();
        assert!(child.is_cancelled());
    }

    #[test]
    fn triggering_child_does_not_affect_parent() {
        let parent = CancelToken::new();
        let child = CancelToken::child(&parent);
        child.trigger();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn deadline_regimes() {
        assert!(Deadline::from_timeout_ms(0).is_none());
        assert!(Deadline::from_timeout_ms(-1).is_none());
        let d = Deadline::from_timeout_ms(10).unwrap();
        assert!(!d.has_elapsed());
    }
}
