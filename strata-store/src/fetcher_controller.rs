//! Single-flight fetching: one shared upstream per key, persisted through
//! the local tiers before it reaches any subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use strata_core::{
    MulticastConfig, ResponseError, ResponseOrigin, StoreKey, StoreReadResponse, StoreValue,
    StrataResult,
};
use strata_multicast::{Downstream, Multicaster, UpstreamFactory};
use tracing::{debug, warn};

use crate::fetcher::FetcherResult;
use crate::tiers::Tiers;

type SharedFetch<V> = Arc<Multicaster<StoreReadResponse<V>>>;

struct ActiveFetch<V: StoreValue> {
    multicaster: SharedFetch<V>,
    leases: usize,
}

type ActiveFetches<K, V> = Arc<Mutex<HashMap<K, ActiveFetch<V>>>>;

/// Keeps a key's multicaster registered while held.
struct FetchLease<K: StoreKey, V: StoreValue> {
    key: K,
    multicaster: SharedFetch<V>,
    active: ActiveFetches<K, V>,
    keep_alive: bool,
}

impl<K: StoreKey, V: StoreValue> Drop for FetchLease<K, V> {
    fn drop(&mut self) {
        let released = {
            let mut active = self.active.lock();
            match active.get_mut(&self.key) {
                Some(entry) if Arc::ptr_eq(&entry.multicaster, &self.multicaster) => {
                    entry.leases = entry.leases.saturating_sub(1);
                    if entry.leases == 0 && !self.keep_alive {
                        active.remove(&self.key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(entry) = released {
            entry.multicaster.close();
            debug!(key = ?self.key, "Released fetch for key");
        }
    }
}

pub(crate) struct FetcherController<K: StoreKey, V: StoreValue> {
    tiers: Arc<Tiers<K, V>>,
    config: MulticastConfig,
    active: ActiveFetches<K, V>,
}

impl<K: StoreKey, V: StoreValue> Clone for FetcherController<K, V> {
    fn clone(&self) -> Self {
        Self {
            tiers: Arc::clone(&self.tiers),
            config: self.config.clone(),
            active: Arc::clone(&self.active),
        }
    }
}

impl<K: StoreKey, V: StoreValue> FetcherController<K, V> {
    pub(crate) fn new(tiers: Arc<Tiers<K, V>>, config: MulticastConfig) -> Self {
        Self {
            tiers,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Keys with a registered multicaster.
    pub(crate) fn in_flight(&self) -> usize {
        self.active.lock().len()
    }

    /// Join the shared fetch for `key`, starting one if none is running.
    ///
    /// Fetched data has already been written to the source of truth and
    /// memory by the time it is emitted here.
    pub(crate) fn fetch(&self, key: K) -> BoxStream<'static, StoreReadResponse<V>> {
        let controller = self.clone();
        async_stream::stream! {
            match controller.subscribe(&key).await {
                Ok((_lease, mut downstream)) => {
                    while let Some(item) = downstream.next().await {
                        match item {
                            Ok(response) => yield response,
                            Err(error) => yield StoreReadResponse::Error {
                                origin: ResponseOrigin::Fetcher,
                                error: ResponseError::Exception(error),
                            },
                        }
                    }
                }
                Err(error) => {
                    warn!(key = ?key, error = %error, "Could not join fetch");
                    yield StoreReadResponse::Error {
                        origin: ResponseOrigin::Fetcher,
                        error: ResponseError::Exception(error),
                    };
                }
            }
        }
        .boxed()
    }

    async fn subscribe(
        &self,
        key: &K,
    ) -> StrataResult<(FetchLease<K, V>, Downstream<StoreReadResponse<V>>)> {
        let lease = self.acquire(key)?;
        let downstream = lease.multicaster.new_downstream(false).await?;
        Ok((lease, downstream))
    }

    fn acquire(&self, key: &K) -> StrataResult<FetchLease<K, V>> {
        let mut active = self.active.lock();
        let multicaster = match active.get_mut(key) {
            Some(entry) => {
                entry.leases += 1;
                Arc::clone(&entry.multicaster)
            }
            None => {
                let multicaster = Arc::new(Multicaster::new(
                    self.config.clone(),
                    self.upstream(key.clone()),
                )?);
                active.insert(
                    key.clone(),
                    ActiveFetch {
                        multicaster: Arc::clone(&multicaster),
                        leases: 1,
                    },
                );
                debug!(key = ?key, "Registered fetch for key");
                multicaster
            }
        };
        Ok(FetchLease {
            key: key.clone(),
            multicaster,
            active: Arc::clone(&self.active),
            keep_alive: self.config.keep_upstream_alive,
        })
    }

    /// Each run fetches, persists every value, and reports an empty fetch
    /// as `NoNewData`.
    fn upstream(&self, key: K) -> UpstreamFactory<StoreReadResponse<V>> {
        let tiers = Arc::clone(&self.tiers);
        Arc::new(move || {
            let tiers = Arc::clone(&tiers);
            let key = key.clone();
            async_stream::stream! {
                let mut results = tiers.fetcher.fetch(key.clone());
                let mut produced = false;
                while let Some(result) = results.next().await {
                    produced = true;
                    let response = match result {
                        FetcherResult::Data { value, .. } => tiers.persist_fetched(&key, value).await,
                        FetcherResult::Error(error) => {
                            warn!(
                                key = ?key,
                                fetcher = tiers.fetcher.name().unwrap_or("unnamed"),
                                error = %error.message(),
                                "Fetch failed"
                            );
                            StoreReadResponse::Error {
                                origin: ResponseOrigin::Fetcher,
                                error,
                            }
                        }
                    };
                    yield StrataResult::Ok(response);
                }
                if !produced {
                    debug!(key = ?key, "Fetch produced no data");
                    yield StrataResult::Ok(StoreReadResponse::NoNewData {
                        origin: ResponseOrigin::Fetcher,
                    });
                }
            }
            .boxed()
        })
    }
}
