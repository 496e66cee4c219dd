//! Reentrancy-depth counting.
//!
//! A [`ScopedCounter`] answers "am I already inside an operation of this
//! kind?". Entering returns a [`CounterGuard`]; dropping the guard leaves the
//! scope. Because leaving is tied to the guard's lifetime, exits always match
//! the most recent unmatched enter and the depth can never go negative.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared nesting-depth counter for one guarded resource.
///
/// Clones share the same depth.
#[derive(Debug, Clone, Default)]
pub struct ScopedCounter {
    depth: Arc<AtomicUsize>,
}

impl ScopedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a scope. The depth is decremented when the returned guard drops.
    #[must_use = "the scope ends as soon as the guard is dropped"]
    pub fn enter(&self) -> CounterGuard {
        self.depth.fetch_add(1, Ordering::AcqRel);
        CounterGuard {
            depth: Arc::clone(&self.depth),
        }
    }

    /// Run `f` inside a scope.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enter();
        f()
    }

    /// Await `fut` inside a scope.
    ///
    /// The scope is held across every suspension point of `fut` and released
    /// when it completes or is dropped.
    pub async fn scope_async<F: Future>(&self, fut: F) -> F::Output {
        let _guard = self.enter();
        fut.await
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// True while at least one scope is open.
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }
}

/// Open scope of a [`ScopedCounter`].
#[derive(Debug)]
pub struct CounterGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}
