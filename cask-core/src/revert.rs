//! Scoped undo stacks for multi-step operations.
//!
//! Every multi-step lifecycle operation follows the same shape: create a
//! reverter, push a compensation hook after each successful external effect,
//! and either call [`Reverter::success`] at the end or run [`Reverter::fail`]
//! on the error path to unwind in LIFO order.
//!
//! Cloning a reverter yields an independent stack holding the same hooks, so
//! a long-running operation can hand the rollback chain to a background task
//! that calls success/fail itself.

use futures::future::BoxFuture;
use std::sync::Arc;

/// A single compensation hook.
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// An ordered undo stack.
#[derive(Clone, Default)]
pub struct Reverter {
    hooks: Vec<Hook>,
}

impl Reverter {
    /// Create an empty reverter.
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Push a compensation hook for the most recent successful step.
    pub fn add<F, Fut>(&mut self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.hooks.push(Arc::new(move || Box::pin(hook())));
    }

    /// Push an already-boxed hook (used to chain hooks returned by
    /// collaborators, e.g. storage revert hooks).
    pub fn add_hook(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    /// Run all pushed hooks in reverse order and clear the stack.
    pub async fn fail(&mut self) {
        while let Some(hook) = self.hooks.pop() {
            hook().await;
        }
    }

    /// Discard all hooks; the operation completed.
    pub fn success(&mut self) {
        self.hooks.clear();
    }

    /// Number of pending hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Collapse the stack into a single hook that runs the whole chain, for
    /// handing to collaborators that expect one callback.
    pub fn into_hook(mut self) -> Hook {
        let hooks = std::mem::take(&mut self.hooks);
        Arc::new(move || {
            let hooks = hooks.clone();
            Box::pin(async move {
                for hook in hooks.iter().rev() {
                    hook().await;
                }
            })
        })
    }
}

impl std::fmt::Debug for Reverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reverter").field("hooks", &self.hooks.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_fail_runs_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut reverter = Reverter::new();

        for i in 0..3 {
            let order = order.clone();
            reverter.add(move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(i);
                }
            });
        }

        reverter.fail().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(reverter.is_empty());
    }

    #[tokio::test]
    async fn test_success_discards() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reverter = Reverter::new();

        let counter = calls.clone();
        reverter.add(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        reverter.success();
        reverter.fail().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clone_is_independent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reverter = Reverter::new();

        let counter = calls.clone();
        reverter.add(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut handed_off = reverter.clone();

        // The background owner fails: hooks run once.
        handed_off.fail().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The original succeeds afterwards: hooks must not run again.
        reverter.success();
        reverter.fail().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
