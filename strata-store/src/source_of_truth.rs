//! The durable local tier.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use strata_core::{StoreKey, StoreValue, StrataResult};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Durable local storage for fetched and locally written values.
///
/// `reader` may be one-shot (a single item, then end) or observable (the
/// current value, then every later change). `None` means the key has no
/// value.
#[async_trait]
pub trait SourceOfTruth<K, V>: Send + Sync {
    fn reader(&self, key: &K) -> BoxStream<'static, StrataResult<Option<V>>>;

    async fn write(&self, key: &K, value: &V) -> StrataResult<()>;

    async fn delete(&self, key: &K) -> StrataResult<()>;

    async fn delete_all(&self) -> StrataResult<()>;
}

#[async_trait]
impl<K, V, T> SourceOfTruth<K, V> for Arc<T>
where
    T: SourceOfTruth<K, V> + ?Sized,
    K: Sync,
    V: Sync,
{
    fn reader(&self, key: &K) -> BoxStream<'static, StrataResult<Option<V>>> {
        (**self).reader(key)
    }

    async fn write(&self, key: &K, value: &V) -> StrataResult<()> {
        (**self).write(key, value).await
    }

    async fn delete(&self, key: &K) -> StrataResult<()> {
        (**self).delete(key).await
    }

    async fn delete_all(&self) -> StrataResult<()> {
        (**self).delete_all().await
    }
}

// ============================================================================
// IN-MEMORY SOURCE OF TRUTH
// ============================================================================

/// Source of truth kept in process memory.
///
/// Each key owns a `watch` channel, so observable readers see every later
/// write and delete. Useful for tests and for stores that only want the
/// reactive behavior of a durable tier.
pub struct InMemorySourceOfTruth<K, V> {
    entries: DashMap<K, watch::Sender<Option<V>>>,
    observable: bool,
}

impl<K: StoreKey, V: std::fmt::Debug> std::fmt::Debug for InMemorySourceOfTruth<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySourceOfTruth")
            .field("entries", &self.entries)
            .field("observable", &self.observable)
            .finish()
    }
}

impl<K: StoreKey, V: StoreValue> InMemorySourceOfTruth<K, V> {
    /// Readers emit the current value and then follow changes.
    pub fn observable() -> Self {
        Self {
            entries: DashMap::new(),
            observable: true,
        }
    }

    /// Readers emit the current value once and end.
    pub fn one_shot() -> Self {
        Self {
            entries: DashMap::new(),
            observable: false,
        }
    }

    /// Current value for `key`, without subscribing.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries
            .get(key)
            .and_then(|sender| sender.borrow().clone())
    }

    /// Number of keys currently holding a value.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn subscribe(&self, key: &K) -> watch::Receiver<Option<V>> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> SourceOfTruth<K, V> for InMemorySourceOfTruth<K, V> {
    fn reader(&self, key: &K) -> BoxStream<'static, StrataResult<Option<V>>> {
        let receiver = self.subscribe(key);
        if self.observable {
            WatchStream::new(receiver).map(Ok).boxed()
        } else {
            let current = receiver.borrow().clone();
            stream::once(async move { Ok(current) }).boxed()
        }
    }

    async fn write(&self, key: &K, value: &V) -> StrataResult<()> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(value.clone()));
        Ok(())
    }

    async fn delete(&self, key: &K) -> StrataResult<()> {
        if let Some(sender) = self.entries.get(key) {
            sender.send_replace(None);
        }
        Ok(())
    }

    async fn delete_all(&self) -> StrataResult<()> {
        for entry in self.entries.iter() {
            entry.value().send_replace(None);
        }
        Ok(())
    }
}

// ============================================================================
// MAPPED SOURCE OF TRUTH
// ============================================================================

/// Presents a source of truth holding `L` values as one holding `V` values.
pub struct MappedSourceOfTruth<S, L, V> {
    inner: S,
    to_local: Arc<dyn Fn(&V) -> L + Send + Sync>,
    from_local: Arc<dyn Fn(L) -> V + Send + Sync>,
    _marker: PhantomData<fn() -> (L, V)>,
}

impl<S, L, V> MappedSourceOfTruth<S, L, V> {
    pub fn new<To, From>(inner: S, to_local: To, from_local: From) -> Self
    where
        To: Fn(&V) -> L + Send + Sync + 'static,
        From: Fn(L) -> V + Send + Sync + 'static,
    {
        Self {
            inner,
            to_local: Arc::new(to_local),
            from_local: Arc::new(from_local),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K, L, V, S> SourceOfTruth<K, V> for MappedSourceOfTruth<S, L, V>
where
    S: SourceOfTruth<K, L>,
    K: StoreKey,
    L: StoreValue,
    V: StoreValue,
{
    fn reader(&self, key: &K) -> BoxStream<'static, StrataResult<Option<V>>> {
        let from_local = Arc::clone(&self.from_local);
        self.inner
            .reader(key)
            .map(move |item| item.map(|local| local.map(|l| from_local(l))))
            .boxed()
    }

    async fn write(&self, key: &K, value: &V) -> StrataResult<()> {
        let local = (self.to_local)(value);
        self.inner.write(key, &local).await
    }

    async fn delete(&self, key: &K) -> StrataResult<()> {
        self.inner.delete(key).await
    }

    async fn delete_all(&self) -> StrataResult<()> {
        self.inner.delete_all().await
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_one_shot_reader_emits_once() {
        let sot = InMemorySourceOfTruth::<u32, String>::one_shot();
        sot.write(&1, &"a".to_string()).await.unwrap();

        let items: Vec<_> = sot.reader(&1).collect().await;
        assert_eq!(items, vec![Ok(Some("a".to_string()))]);

        let missing: Vec<_> = sot.reader(&2).collect().await;
        assert_eq!(missing, vec![Ok(None)]);
    }

    #[tokio::test]
    async fn test_observable_reader_follows_writes() {
        let sot = InMemorySourceOfTruth::<u32, String>::observable();
        let mut reader = sot.reader(&1);
        assert_eq!(reader.next().await, Some(Ok(None)));

        sot.write(&1, &"a".to_string()).await.unwrap();
        let next = timeout(Duration::from_secs(1), reader.next()).await.unwrap();
        assert_eq!(next, Some(Ok(Some("a".to_string()))));

        sot.delete(&1).await.unwrap();
        let next = timeout(Duration::from_secs(1), reader.next()).await.unwrap();
        assert_eq!(next, Some(Ok(None)));
    }

    #[tokio::test]
    async fn test_delete_all_clears_every_key() {
        let sot = InMemorySourceOfTruth::<u32, u32>::one_shot();
        for key in 0..5 {
            sot.write(&key, &(key * 10)).await.unwrap();
        }
        assert_eq!(sot.len(), 5);
        sot.delete_all().await.unwrap();
        assert!(sot.is_empty());
        assert_eq!(sot.peek(&3), None);
    }

    #[tokio::test]
    async fn test_mapped_source_of_truth_converts_both_ways() {
        let raw = Arc::new(InMemorySourceOfTruth::<u32, String>::one_shot());
        let mapped = MappedSourceOfTruth::new(
            Arc::clone(&raw),
            |value: &u64| value.to_string(),
            |local: String| local.parse::<u64>().unwrap_or_default(),
        );

        mapped.write(&1, &42u64).await.unwrap();
        assert_eq!(raw.peek(&1), Some("42".to_string()));

        let items: Vec<_> = mapped.reader(&1).collect().await;
        assert_eq!(items, vec![Ok(Some(42u64))]);
    }
}
