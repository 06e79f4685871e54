//! The local tiers of a store and the operations that touch them under
//! per-key thread safety.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::StreamExt;
use strata_cache::Cache;
use strata_core::{
    logical_now, ResponseError, ResponseOrigin, StoreKey, StoreReadResponse, StoreValue,
    StrataResult,
};
use tracing::{debug, warn};

use crate::fetcher::Fetcher;
use crate::source_of_truth::SourceOfTruth;
use crate::thread_safety::ThreadSafetyController;

/// Last value received from the fetcher for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnapshot<V> {
    pub value: V,
    /// Logical time the value was persisted, comparable with
    /// `StoreWriteRequest::created`.
    pub fetched_at: u64,
}

pub(crate) struct Tiers<K, V> {
    pub(crate) fetcher: Arc<dyn Fetcher<K, V>>,
    pub(crate) source_of_truth: Option<Arc<dyn SourceOfTruth<K, V>>>,
    pub(crate) memory: Option<Cache<K, V>>,
    pub(crate) thread_safety: ThreadSafetyController<K>,
    remote: DashMap<K, RemoteSnapshot<V>>,
    track_remote: AtomicBool,
}

impl<K: StoreKey, V: StoreValue> Tiers<K, V> {
    pub(crate) fn new(
        fetcher: Arc<dyn Fetcher<K, V>>,
        source_of_truth: Option<Arc<dyn SourceOfTruth<K, V>>>,
        memory: Option<Cache<K, V>>,
    ) -> Self {
        Self {
            fetcher,
            source_of_truth,
            memory,
            thread_safety: ThreadSafetyController::new(),
            remote: DashMap::new(),
            track_remote: AtomicBool::new(false),
        }
    }

    pub(crate) fn memory_get(&self, key: &K) -> Option<V> {
        self.memory.as_ref().and_then(|memory| memory.get(key))
    }

    /// Start remembering fetched values for conflict detection.
    pub(crate) fn track_remote(&self) {
        self.track_remote.store(true, Ordering::SeqCst);
    }

    pub(crate) fn remote_snapshot(&self, key: &K) -> Option<RemoteSnapshot<V>> {
        self.remote.get(key).map(|snapshot| snapshot.value().clone())
    }

    /// Put a value read from the source of truth into memory.
    pub(crate) async fn cache_local(&self, key: &K, value: &V) {
        let Some(memory) = &self.memory else {
            return;
        };
        let cached = self
            .thread_safety
            .with_read_completion(key, || async {
                memory.put(key.clone(), value.clone());
            })
            .await;
        if let Err(error) = cached {
            warn!(key = ?key, error = %error, "Skipped caching source of truth value");
        }
    }

    /// Persist a fetched value to the source of truth, then to memory.
    ///
    /// A failed source of truth write leaves memory untouched and is
    /// reported as an error from the source of truth.
    pub(crate) async fn persist_fetched(&self, key: &K, value: V) -> StoreReadResponse<V> {
        let persisted = self
            .thread_safety
            .with_read_completion(key, || async {
                if let Some(source_of_truth) = &self.source_of_truth {
                    source_of_truth.write(key, &value).await?;
                }
                if let Some(memory) = &self.memory {
                    memory.put(key.clone(), value.clone());
                }
                if self.track_remote.load(Ordering::SeqCst) {
                    self.remote.insert(
                        key.clone(),
                        RemoteSnapshot {
                            value: value.clone(),
                            fetched_at: logical_now(),
                        },
                    );
                }
                StrataResult::Ok(())
            })
            .await
            .and_then(|inner| inner);

        match persisted {
            Ok(()) => {
                debug!(key = ?key, "Persisted fetched value");
                StoreReadResponse::Data {
                    value,
                    origin: ResponseOrigin::Fetcher,
                }
            }
            Err(error) => {
                warn!(key = ?key, error = %error, "Failed to persist fetched value");
                StoreReadResponse::Error {
                    origin: ResponseOrigin::SourceOfTruth,
                    error: ResponseError::Exception(error),
                }
            }
        }
    }

    /// First item of a fresh source of truth reader. `Ok(None)` when there is
    /// no source of truth, no value, or the reader ended without emitting.
    pub(crate) async fn read_source_of_truth(&self, key: &K) -> StrataResult<Option<V>> {
        let Some(source_of_truth) = &self.source_of_truth else {
            return Ok(None);
        };
        let mut reader = source_of_truth.reader(key);
        reader.next().await.unwrap_or(Ok(None))
    }

    /// Memory first, then the source of truth.
    pub(crate) async fn latest(&self, key: &K) -> StrataResult<Option<(V, ResponseOrigin)>> {
        if let Some(value) = self.memory_get(key) {
            return Ok(Some((value, ResponseOrigin::Cache)));
        }
        Ok(self
            .read_source_of_truth(key)
            .await?
            .map(|value| (value, ResponseOrigin::SourceOfTruth)))
    }

    /// Apply a local write to every local tier with the key held exclusively.
    pub(crate) async fn write_local(&self, key: &K, value: &V) -> StrataResult<()> {
        self.write_local_then(key, value, || ()).await
    }

    /// Like [`write_local`](Self::write_local), running `then` in the same
    /// exclusive section once every tier accepted the value.
    pub(crate) async fn write_local_then<T>(
        &self,
        key: &K,
        value: &V,
        then: impl FnOnce() -> T,
    ) -> StrataResult<T> {
        self.thread_safety
            .with_thread_safety(key, || async {
                if let Some(source_of_truth) = &self.source_of_truth {
                    source_of_truth.write(key, value).await?;
                }
                if let Some(memory) = &self.memory {
                    memory.put(key.clone(), value.clone());
                }
                StrataResult::Ok(then())
            })
            .await
            .and_then(|inner| inner)
    }

    pub(crate) async fn clear(&self, key: &K) -> StrataResult<()> {
        self.thread_safety
            .with_thread_safety(key, || async {
                if let Some(memory) = &self.memory {
                    memory.invalidate(key);
                }
                self.remote.remove(key);
                if let Some(source_of_truth) = &self.source_of_truth {
                    source_of_truth.delete(key).await?;
                }
                StrataResult::Ok(())
            })
            .await
            .and_then(|inner| inner)
    }

    pub(crate) async fn clear_all(&self) -> StrataResult<()> {
        if let Some(memory) = &self.memory {
            memory.invalidate_all();
        }
        self.remote.clear();
        if let Some(source_of_truth) = &self.source_of_truth {
            source_of_truth.delete_all().await?;
        }
        Ok(())
    }
}
