//! Records of keys whose last remote update failed.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use strata_core::{StoreKey, StrataResult, Timestamp};

/// Tracks when a key last failed to sync with the remote.
///
/// A key with a recorded failure still has local state the remote has not
/// accepted. The `bool` results report whether the bookkeeper accepted the
/// change.
#[async_trait]
pub trait Bookkeeper<K>: Send + Sync {
    async fn last_failed_sync(&self, key: &K) -> StrataResult<Option<Timestamp>>;

    async fn set_last_failed_sync(&self, key: &K, at: Timestamp) -> StrataResult<bool>;

    async fn clear(&self, key: &K) -> StrataResult<bool>;

    async fn clear_all(&self) -> StrataResult<bool>;
}

#[async_trait]
impl<K, T> Bookkeeper<K> for Arc<T>
where
    T: Bookkeeper<K> + ?Sized,
    K: Sync,
{
    async fn last_failed_sync(&self, key: &K) -> StrataResult<Option<Timestamp>> {
        (**self).last_failed_sync(key).await
    }

    async fn set_last_failed_sync(&self, key: &K, at: Timestamp) -> StrataResult<bool> {
        (**self).set_last_failed_sync(key, at).await
    }

    async fn clear(&self, key: &K) -> StrataResult<bool> {
        (**self).clear(key).await
    }

    async fn clear_all(&self) -> StrataResult<bool> {
        (**self).clear_all().await
    }
}

/// Bookkeeper kept in process memory.
pub struct InMemoryBookkeeper<K> {
    failed: DashMap<K, Timestamp>,
}

impl<K: StoreKey> std::fmt::Debug for InMemoryBookkeeper<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBookkeeper")
            .field("failed", &self.failed)
            .finish()
    }
}

impl<K: StoreKey> Default for InMemoryBookkeeper<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoreKey> InMemoryBookkeeper<K> {
    pub fn new() -> Self {
        Self {
            failed: DashMap::new(),
        }
    }

    /// Number of keys with a recorded failure.
    pub fn failed_keys(&self) -> usize {
        self.failed.len()
    }
}

#[async_trait]
impl<K: StoreKey> Bookkeeper<K> for InMemoryBookkeeper<K> {
    async fn last_failed_sync(&self, key: &K) -> StrataResult<Option<Timestamp>> {
        Ok(self.failed.get(key).map(|entry| *entry.value()))
    }

    async fn set_last_failed_sync(&self, key: &K, at: Timestamp) -> StrataResult<bool> {
        self.failed.insert(key.clone(), at);
        Ok(true)
    }

    async fn clear(&self, key: &K) -> StrataResult<bool> {
        self.failed.remove(key);
        Ok(true)
    }

    async fn clear_all(&self) -> StrataResult<bool> {
        self.failed.clear();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_failed_sync_round_trip() {
        let bookkeeper = InMemoryBookkeeper::<u32>::new();
        assert_eq!(bookkeeper.last_failed_sync(&1).await, Ok(None));

        let at = Utc::now();
        assert_eq!(bookkeeper.set_last_failed_sync(&1, at).await, Ok(true));
        assert_eq!(bookkeeper.last_failed_sync(&1).await, Ok(Some(at)));
        assert_eq!(bookkeeper.failed_keys(), 1);

        bookkeeper.clear(&1).await.unwrap();
        assert_eq!(bookkeeper.last_failed_sync(&1).await, Ok(None));
    }

    #[tokio::test]
    async fn test_clear_all_forgets_every_key() {
        let bookkeeper = InMemoryBookkeeper::<u32>::new();
        for key in 0..3 {
            bookkeeper.set_last_failed_sync(&key, Utc::now()).await.unwrap();
        }
        bookkeeper.clear_all().await.unwrap();
        assert_eq!(bookkeeper.failed_keys(), 0);
    }
}
