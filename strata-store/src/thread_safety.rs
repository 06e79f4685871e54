//! Per-key coordination between fetch completions, local writes and
//! write queueing.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use strata_core::{describe_key, ConcurrencyError, StoreKey, StrataError, StrataResult};
use tracing::trace;

use crate::lightswitch::Gate;

/// The two rooms kept for each key.
///
/// `read_completions` is shared by fetch completions persisting their
/// results. `write_requests` is shared by writers appending to the write
/// queue. Local writes take both rooms exclusively.
#[derive(Debug, Default)]
pub struct ThreadSafety {
    pub write_requests: Gate,
    pub read_completions: Gate,
}

impl ThreadSafety {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lazily creates one [`ThreadSafety`] per key.
///
/// Records are never removed, so the map grows with the number of distinct
/// keys seen.
pub struct ThreadSafetyController<K> {
    records: DashMap<K, Arc<ThreadSafety>>,
}

impl<K: StoreKey> std::fmt::Debug for ThreadSafetyController<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSafetyController")
            .field("records", &self.records)
            .finish()
    }
}

impl<K: StoreKey> Default for ThreadSafetyController<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_unavailable<K: StoreKey>(key: &K) -> StrataError {
    ConcurrencyError::LockUnavailable {
        key: describe_key(key),
    }
    .into()
}

impl<K: StoreKey> ThreadSafetyController<K> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Get or create the record for `key`. Concurrent callers for the same
    /// key always receive the same record.
    pub fn safe_init(&self, key: &K) -> Arc<ThreadSafety> {
        self.records
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ThreadSafety::new()))
            .clone()
    }

    /// Number of keys with a record.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// Run `block` with both rooms held exclusively.
    pub async fn with_thread_safety<F, Fut, R>(&self, key: &K, block: F) -> StrataResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let record = self.safe_init(key);
        let _writes = record
            .write_requests
            .exclusive()
            .await
            .map_err(|_| lock_unavailable(key))?;
        let _reads = record
            .read_completions
            .exclusive()
            .await
            .map_err(|_| lock_unavailable(key))?;
        trace!(key = ?key, "Holding exclusive thread safety");
        Ok(block().await)
    }

    /// Run `block` as one of possibly many concurrent fetch completions.
    pub async fn with_read_completion<F, Fut, R>(&self, key: &K, block: F) -> StrataResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let record = self.safe_init(key);
        let _guard = record
            .read_completions
            .shared()
            .await
            .map_err(|_| lock_unavailable(key))?;
        Ok(block().await)
    }

    /// Run `block` as one of possibly many concurrent write-queue appends.
    pub async fn with_write_request<F, Fut, R>(&self, key: &K, block: F) -> StrataResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let record = self.safe_init(key);
        let _guard = record
            .write_requests
            .shared()
            .await
            .map_err(|_| lock_unavailable(key))?;
        Ok(block().await)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_safe_init_returns_same_record() {
        let controller = ThreadSafetyController::<u32>::new();
        let a = controller.safe_init(&1);
        let b = controller.safe_init(&1);
        let c = controller.safe_init(&2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(controller.tracked_keys(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_safe_init_agrees() {
        let controller = Arc::new(ThreadSafetyController::<u32>::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move { controller.safe_init(&7) }));
        }
        let mut records = Vec::new();
        for handle in handles {
            records.push(handle.await.unwrap());
        }
        assert!(records.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_read_completions_run_concurrently() {
        let controller = Arc::new(ThreadSafetyController::<u32>::new());
        let (tx, rx) = oneshot::channel::<()>();

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .with_read_completion(&1, || async move {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A second completion must not wait for the first.
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            controller.with_read_completion(&1, || async { 2 }),
        )
        .await
        .expect("shared holders do not block each other");
        assert_eq!(second, Ok(2));

        tx.send(()).unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_block_excludes_read_completion() {
        let controller = Arc::new(ThreadSafetyController::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let writer = {
            let controller = Arc::clone(&controller);
            let inside = Arc::clone(&inside);
            tokio::spawn(async move {
                controller
                    .with_thread_safety(&1, || async move {
                        inside.fetch_add(1, Ordering::SeqCst);
                        let _ = rx.await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reader = {
            let controller = Arc::clone(&controller);
            let inside = Arc::clone(&inside);
            tokio::spawn(async move {
                controller
                    .with_read_completion(&1, || async move { inside.load(Ordering::SeqCst) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        tx.send(()).unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(reader.await.unwrap(), Ok(0));
    }

    #[tokio::test]
    async fn test_other_keys_are_not_blocked() {
        let controller = Arc::new(ThreadSafetyController::<u32>::new());
        let (tx, rx) = oneshot::channel::<()>();
        let writer = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .with_thread_safety(&1, || async move {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            controller.with_thread_safety(&2, || async { "free" }),
        )
        .await
        .expect("key 2 is independent of key 1");
        assert_eq!(other, Ok("free"));

        tx.send(()).unwrap();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_requests_do_not_block_read_completions() {
        let controller = ThreadSafetyController::<u32>::new();
        let result = controller
            .with_write_request(&1, || async {
                controller.with_read_completion(&1, || async { 5 }).await
            })
            .await;
        assert_eq!(result, Ok(Ok(5)));
    }
}
