//! Keyed single-flight: collapse concurrent calls for the same key into one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

/// Deduplicates concurrent in-flight work per key.
///
/// The first caller for a key runs the supplied future; concurrent callers
/// for the same key wait on the same cell and share its result. Once the
/// flight completes the key is retired, so later calls start a fresh one.
pub struct SingleFlight<T: Clone> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<Option<T>>>>>,
}

impl<T: Clone> SingleFlight<T> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, or wait for the in-flight call and share its
    /// result. `None` results are shared with waiters too.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = cell.get_or_init(work).await.clone();

        // Retire the key so the next call after completion starts fresh.
        // Only remove the cell we used; a racing caller may already have
        // installed a new one.
        let mut inflight = self.inflight.lock().await;
        if let Some(existing) = inflight.get(key) {
            if Arc::ptr_eq(existing, &cell) {
                inflight.remove(key);
            }
        }

        value
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_flight() {
        let group = Arc::new(SingleFlight::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                group
                    .run("same-key", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Some(42u64)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let group = SingleFlight::<String>::new();
        let a = group.run("a", || async { Some("a".to_string()) }).await;
        let b = group.run("b", || async { Some("b".to_string()) }).await;
        assert_eq!(a.as_deref(), Some("a"));
        assert_eq!(b.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_key_retired_after_completion() {
        let group = SingleFlight::<u32>::new();
        let first = group.run("k", || async { Some(1) }).await;
        // A completed flight does not pin its result; the next call runs.
        let second = group.run("k", || async { Some(2) }).await;
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));
    }

    #[tokio::test]
    async fn test_failed_flight_shared_then_retired() {
        let group = SingleFlight::<u32>::new();
        let failed = group.run("k", || async { None }).await;
        assert_eq!(failed, None);
        let retried = group.run("k", || async { Some(7) }).await;
        assert_eq!(retried, Some(7));
    }
}
