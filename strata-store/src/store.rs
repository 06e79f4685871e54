//! The read pipeline: memory, then source of truth, then a shared fetch.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use strata_cache::{CacheBuilder, CacheStats, Ticker, Weigher};
use strata_core::{
    describe_key, ConfigError, FetchError, MemoryPolicy, MulticastConfig, ResponseError,
    ResponseOrigin, StoreKey, StoreReadRequest, StoreReadResponse, StoreValue, StrataResult,
};
use tracing::{debug, trace, warn};

use crate::fetcher::Fetcher;
use crate::fetcher_controller::FetcherController;
use crate::source_of_truth::SourceOfTruth;
use crate::thread_safety::ThreadSafetyController;
use crate::tiers::{RemoteSnapshot, Tiers};
use crate::validator::Validator;

/// Memory policy used when the builder is not given one.
pub fn default_memory_policy() -> MemoryPolicy {
    MemoryPolicy::new()
        .with_max_size(100)
        .with_expire_after_write(Duration::from_secs(24 * 60 * 60))
}

struct StoreInner<K: StoreKey, V: StoreValue> {
    tiers: Arc<Tiers<K, V>>,
    fetchers: FetcherController<K, V>,
    validator: Option<Arc<dyn Validator<V>>>,
}

impl<K: StoreKey, V: StoreValue> StoreInner<K, V> {
    async fn is_valid(&self, value: &V) -> bool {
        match &self.validator {
            Some(validator) => validator.is_valid(value).await,
            None => true,
        }
    }
}

/// A keyed, multi-tier store.
///
/// Cloning is cheap; clones share every tier and in-flight fetch.
pub struct Store<K: StoreKey, V: StoreValue> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K: StoreKey, V: StoreValue> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    pub fn builder<F>(fetcher: F) -> StoreBuilder<K, V>
    where
        F: Fetcher<K, V> + 'static,
    {
        StoreBuilder::from_fetcher(fetcher)
    }

    /// Stream responses for `request`.
    ///
    /// The request's completion callback sees every terminal response.
    pub fn stream(&self, request: StoreReadRequest<K>) -> BoxStream<'static, StoreReadResponse<V>> {
        let callbacks = request.clone();
        read_pipeline(Arc::clone(&self.inner), request)
            .inspect(move |response| callbacks.complete_with(response))
            .boxed()
    }

    /// First value for `key`, served from local tiers when present.
    pub async fn get(&self, key: K) -> StrataResult<V> {
        first_data(self.stream(StoreReadRequest::cached(key.clone(), false)), &key).await
    }

    /// First value for `key` from a fetch, skipping local reads.
    ///
    /// If the fetch produces nothing, the last known local value is
    /// returned instead.
    pub async fn fresh(&self, key: K) -> StrataResult<V> {
        first_data(self.stream(StoreReadRequest::fresh(key.clone())), &key).await
    }

    /// Remove `key` from memory and the source of truth.
    pub async fn clear(&self, key: &K) -> StrataResult<()> {
        self.inner.tiers.clear(key).await?;
        debug!(key = ?key, "Cleared key");
        Ok(())
    }

    pub async fn clear_all(&self) -> StrataResult<()> {
        self.inner.tiers.clear_all().await?;
        debug!("Cleared store");
        Ok(())
    }

    pub fn thread_safety(&self) -> &ThreadSafetyController<K> {
        &self.inner.tiers.thread_safety
    }

    /// Memory tier statistics, if memory caching is enabled.
    pub fn memory_stats(&self) -> Option<CacheStats> {
        self.inner.tiers.memory.as_ref().map(|memory| memory.stats())
    }

    /// Keys with a fetch currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.fetchers.in_flight()
    }

    pub fn has_source_of_truth(&self) -> bool {
        self.inner.tiers.source_of_truth.is_some()
    }

    pub(crate) async fn write_local(&self, key: &K, value: &V) -> StrataResult<()> {
        self.inner.tiers.write_local(key, value).await
    }

    pub(crate) async fn write_local_then<T>(
        &self,
        key: &K,
        value: &V,
        then: impl FnOnce() -> T,
    ) -> StrataResult<T> {
        self.inner.tiers.write_local_then(key, value, then).await
    }

    pub(crate) async fn latest(&self, key: &K) -> StrataResult<Option<V>> {
        Ok(self.inner.tiers.latest(key).await?.map(|(value, _)| value))
    }

    pub(crate) fn track_remote(&self) {
        self.inner.tiers.track_remote();
    }

    pub(crate) fn remote_snapshot(&self, key: &K) -> Option<RemoteSnapshot<V>> {
        self.inner.tiers.remote_snapshot(key)
    }
}

/// Drain `responses` until the first value.
pub(crate) async fn first_data<K: StoreKey, V>(
    mut responses: BoxStream<'static, StoreReadResponse<V>>,
    key: &K,
) -> StrataResult<V> {
    while let Some(response) = responses.next().await {
        match response {
            StoreReadResponse::Data { value, .. } => return Ok(value),
            StoreReadResponse::Error { origin, error } => return Err(error.into_error(origin)),
            StoreReadResponse::Loading { .. } | StoreReadResponse::NoNewData { .. } => {}
        }
    }
    Err(FetchError::NoData {
        key: describe_key(key),
    }
    .into())
}

fn read_pipeline<K: StoreKey, V: StoreValue>(
    inner: Arc<StoreInner<K, V>>,
    request: StoreReadRequest<K>,
) -> impl Stream<Item = StoreReadResponse<V>> + Send + 'static {
    async_stream::stream! {
        let key = request.key.clone();
        let tiers = Arc::clone(&inner.tiers);
        let mut needs_fetch = request.refresh;
        let mut served = false;
        let mut failed = false;

        // ====================================================================
        // MEMORY
        // ====================================================================

        if !request.skips_memory() {
            if let Some(value) = tiers.memory_get(&key) {
                if !inner.is_valid(&value).await {
                    needs_fetch = true;
                }
                served = true;
                trace!(key = ?key, "Served from memory");
                yield StoreReadResponse::Data { value, origin: ResponseOrigin::Cache };
            }
        }

        // ====================================================================
        // SOURCE OF TRUTH
        // ====================================================================

        let mut reader = None;
        if let Some(source_of_truth) = tiers.source_of_truth.as_ref() {
            if !request.skips_source_of_truth() {
                let mut values = source_of_truth.reader(&key);
                match values.next().await {
                    Some(Ok(Some(value))) => {
                        tiers.cache_local(&key, &value).await;
                        if !inner.is_valid(&value).await {
                            needs_fetch = true;
                        }
                        served = true;
                        yield StoreReadResponse::Data { value, origin: ResponseOrigin::SourceOfTruth };
                    }
                    Some(Ok(None)) | None => {}
                    Some(Err(error)) => {
                        warn!(key = ?key, error = %error, "Source of truth read failed");
                        failed = true;
                        yield StoreReadResponse::Error {
                            origin: ResponseOrigin::SourceOfTruth,
                            error: ResponseError::Exception(error),
                        };
                    }
                }
                reader = Some(values);
            }
        }

        if !served {
            needs_fetch = true;
        }
        if request.local_only {
            needs_fetch = false;
            if !served && !failed {
                let origin = if tiers.source_of_truth.is_some() {
                    ResponseOrigin::SourceOfTruth
                } else {
                    ResponseOrigin::Cache
                };
                yield StoreReadResponse::NoNewData { origin };
            }
        }

        // ====================================================================
        // FETCH
        // ====================================================================

        if needs_fetch {
            yield StoreReadResponse::Loading { origin: ResponseOrigin::Fetcher };
            let mut fetched = inner.fetchers.fetch(key.clone());
            while let Some(response) = fetched.next().await {
                match response {
                    StoreReadResponse::Data { value, origin } => {
                        served = true;
                        match tiers.source_of_truth.as_ref() {
                            Some(source_of_truth) => {
                                // Serve what was persisted, and keep following it.
                                let mut values = source_of_truth.reader(&key);
                                let first = values.next().await;
                                reader = Some(values);
                                match first {
                                    Some(Ok(Some(persisted))) => {
                                        yield StoreReadResponse::Data { value: persisted, origin };
                                    }
                                    Some(Err(error)) => {
                                        yield StoreReadResponse::Error {
                                            origin: ResponseOrigin::SourceOfTruth,
                                            error: ResponseError::Exception(error),
                                        };
                                    }
                                    Some(Ok(None)) | None => {
                                        yield StoreReadResponse::Data { value, origin };
                                    }
                                }
                            }
                            None => yield StoreReadResponse::Data { value, origin },
                        }
                    }
                    StoreReadResponse::NoNewData { origin } => {
                        yield StoreReadResponse::NoNewData { origin };
                        if !served {
                            if let Some(value) = tiers.memory_get(&key) {
                                served = true;
                                yield StoreReadResponse::Data { value, origin: ResponseOrigin::Cache };
                            } else if let Ok(Some(value)) = tiers.read_source_of_truth(&key).await {
                                served = true;
                                tiers.cache_local(&key, &value).await;
                                yield StoreReadResponse::Data { value, origin: ResponseOrigin::SourceOfTruth };
                            }
                        }
                    }
                    StoreReadResponse::Error { origin, error } => {
                        yield StoreReadResponse::Error { origin, error };
                        if request.fallback_to_source_of_truth && !served {
                            if let Ok(Some(value)) = tiers.read_source_of_truth(&key).await {
                                served = true;
                                yield StoreReadResponse::Data { value, origin: ResponseOrigin::SourceOfTruth };
                            }
                        }
                    }
                    StoreReadResponse::Loading { .. } => {}
                }
            }
        }

        // ====================================================================
        // LATER SOURCE OF TRUTH CHANGES
        // ====================================================================

        if let Some(mut values) = reader {
            while let Some(item) = values.next().await {
                match item {
                    Ok(Some(value)) => {
                        tiers.cache_local(&key, &value).await;
                        yield StoreReadResponse::Data { value, origin: ResponseOrigin::SourceOfTruth };
                    }
                    Ok(None) => {}
                    Err(error) => {
                        yield StoreReadResponse::Error {
                            origin: ResponseOrigin::SourceOfTruth,
                            error: ResponseError::Exception(error),
                        };
                    }
                }
            }
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`Store`]. Configuration is validated in [`build`](Self::build).
pub struct StoreBuilder<K: StoreKey, V: StoreValue> {
    fetcher: Arc<dyn Fetcher<K, V>>,
    source_of_truth: Option<Arc<dyn SourceOfTruth<K, V>>>,
    memory_policy: Option<MemoryPolicy>,
    weigher: Option<Weigher<K, V>>,
    ticker: Option<Arc<dyn Ticker>>,
    multicast: MulticastConfig,
    validator: Option<Arc<dyn Validator<V>>>,
}

impl<K: StoreKey, V: StoreValue> StoreBuilder<K, V> {
    pub fn from_fetcher<F>(fetcher: F) -> Self
    where
        F: Fetcher<K, V> + 'static,
    {
        Self {
            fetcher: Arc::new(fetcher),
            source_of_truth: None,
            memory_policy: Some(default_memory_policy()),
            weigher: None,
            ticker: None,
            multicast: MulticastConfig::default(),
            validator: None,
        }
    }

    pub fn source_of_truth<S>(mut self, source_of_truth: S) -> Self
    where
        S: SourceOfTruth<K, V> + 'static,
    {
        self.source_of_truth = Some(Arc::new(source_of_truth));
        self
    }

    pub fn memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = Some(policy);
        self
    }

    /// Run without a memory tier.
    pub fn disable_cache(mut self) -> Self {
        self.memory_policy = None;
        self
    }

    pub fn weigher<F>(mut self, weigher: F) -> Self
    where
        F: Fn(&K, &V) -> u64 + Send + Sync + 'static,
    {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    pub fn multicast(mut self, config: MulticastConfig) -> Self {
        self.multicast = config;
        self
    }

    pub fn validator<T>(mut self, validator: T) -> Self
    where
        T: Validator<V> + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn build(self) -> StrataResult<Store<K, V>> {
        self.multicast.validate()?;
        if self.multicast.piggybacking_downstream {
            // Fetch streams must end when their fetch does.
            return Err(ConfigError::IncompatibleOptions {
                option_a: "piggybacking_downstream".to_string(),
                option_b: "store fetches".to_string(),
            }
            .into());
        }

        let memory = match &self.memory_policy {
            Some(policy) => {
                policy.validate()?;
                let mut builder = CacheBuilder::from_policy(policy);
                if let Some(weigher) = self.weigher {
                    builder = builder.weigher(weigher);
                }
                if let Some(ticker) = self.ticker {
                    builder = builder.ticker(ticker);
                }
                Some(builder.build()?)
            }
            None => None,
        };

        debug!(
            fetcher = self.fetcher.name().unwrap_or("unnamed"),
            memory = memory.is_some(),
            source_of_truth = self.source_of_truth.is_some(),
            "Built store"
        );

        let tiers = Arc::new(Tiers::new(self.fetcher, self.source_of_truth, memory));
        let fetchers = FetcherController::new(Arc::clone(&tiers), self.multicast);
        Ok(Store {
            inner: Arc::new(StoreInner {
                tiers,
                fetchers,
                validator: self.validator,
            }),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{fetcher_fn, fetcher_stream_fn};
    use crate::source_of_truth::InMemorySourceOfTruth;
    use crate::validator::validator_fn;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_store(calls: Arc<AtomicUsize>) -> Store<u32, String> {
        Store::builder(fetcher_fn(move |key: u32| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{key}-{n}"))
            }
        }))
        .build()
        .unwrap()
    }

    async fn collect(store: &Store<u32, String>, request: StoreReadRequest<u32>) -> Vec<StoreReadResponse<String>> {
        store.stream(request).collect().await
    }

    #[tokio::test]
    async fn test_cache_miss_fetches_then_serves_memory() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(Arc::clone(&calls));

        let first = collect(&store, StoreReadRequest::cached(1, false)).await;
        assert_eq!(
            first,
            vec![
                StoreReadResponse::Loading { origin: ResponseOrigin::Fetcher },
                StoreReadResponse::Data { value: "1-0".to_string(), origin: ResponseOrigin::Fetcher },
            ]
        );

        let second = collect(&store, StoreReadRequest::cached(1, false)).await;
        assert_eq!(
            second,
            vec![StoreReadResponse::Data { value: "1-0".to_string(), origin: ResponseOrigin::Cache }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_serves_cache_then_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(Arc::clone(&calls));
        store.get(1).await.unwrap();

        let responses = collect(&store, StoreReadRequest::cached(1, true)).await;
        let origins: Vec<_> = responses.iter().map(|r| r.origin()).collect();
        assert_eq!(
            origins,
            vec![ResponseOrigin::Cache, ResponseOrigin::Fetcher, ResponseOrigin::Fetcher]
        );
        assert_eq!(responses[2].data(), Some(&"1-1".to_string()));
        assert_eq!(store.get(1).await.unwrap(), "1-1");
    }

    #[tokio::test]
    async fn test_fetch_error_leaves_tiers_untouched() {
        let store: Store<u32, String> = Store::builder(fetcher_fn(|_key: u32| async move {
            Err::<String, _>(FetchError::Failed { reason: "offline".to_string() }.into())
        }))
        .build()
        .unwrap();

        let err = store.get(1).await.unwrap_err();
        assert_eq!(
            err,
            strata_core::StrataError::from(FetchError::Failed { reason: "offline".to_string() })
        );
        assert_eq!(store.memory_stats().map(|s| s.entry_count), Some(0));
    }

    #[tokio::test]
    async fn test_empty_fetch_reports_no_new_data() {
        let store: Store<u32, String> =
            Store::builder(fetcher_stream_fn(|_key: u32| stream::empty::<StrataResult<String>>()))
                .build()
                .unwrap();

        let responses = collect(&store, StoreReadRequest::cached(1, false)).await;
        assert_eq!(
            responses,
            vec![
                StoreReadResponse::Loading { origin: ResponseOrigin::Fetcher },
                StoreReadResponse::NoNewData { origin: ResponseOrigin::Fetcher },
            ]
        );
        assert!(matches!(
            store.get(1).await,
            Err(strata_core::StrataError::Fetch(FetchError::NoData { .. }))
        ));
    }

    #[tokio::test]
    async fn test_source_of_truth_value_served_and_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sot = Arc::new(InMemorySourceOfTruth::<u32, String>::one_shot());
        sot.write(&1, &"disk".to_string()).await.unwrap();

        let fetch_calls = Arc::clone(&calls);
        let store = Store::builder(fetcher_fn(move |_key: u32| {
            fetch_calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok("remote".to_string()) }
        }))
        .source_of_truth(Arc::clone(&sot))
        .build()
        .unwrap();

        let responses = collect(&store, StoreReadRequest::skip_memory(1, false)).await;
        assert_eq!(
            responses,
            vec![StoreReadResponse::Data {
                value: "disk".to_string(),
                origin: ResponseOrigin::SourceOfTruth
            }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.memory_stats().map(|s| s.entry_count), Some(1));
    }

    #[tokio::test]
    async fn test_invalid_local_value_forces_fetch() {
        let store = Store::builder(fetcher_fn(|_key: u32| async move { Ok("fresh".to_string()) }))
            .validator(validator_fn(|value: &String| value != "stale"))
            .build()
            .unwrap();
        store.write_local(&1, &"stale".to_string()).await.unwrap();

        let responses = collect(&store, StoreReadRequest::cached(1, false)).await;
        assert_eq!(responses.first().and_then(|r| r.data()), Some(&"stale".to_string()));
        assert_eq!(responses.last().and_then(|r| r.data()), Some(&"fresh".to_string()));
    }

    #[tokio::test]
    async fn test_local_only_never_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(Arc::clone(&calls));

        let responses = collect(&store, StoreReadRequest::local_only(1)).await;
        assert_eq!(
            responses,
            vec![StoreReadResponse::NoNewData { origin: ResponseOrigin::Cache }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_completion_callback_sees_terminal_responses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(calls);
        let completions = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen = Arc::clone(&completions);
        let request = StoreReadRequest::fresh(9).with_on_complete(Arc::new(
            move |completion: strata_core::ReadCompletion| {
                seen.lock().push(completion);
            },
        ));
        let _: Vec<_> = store.stream(request).collect().await;

        assert_eq!(
            completions.lock().clone(),
            vec![strata_core::ReadCompletion::Success { origin: ResponseOrigin::Fetcher }]
        );
    }

    #[tokio::test]
    async fn test_clear_removes_memory_and_source_of_truth() {
        let sot = Arc::new(InMemorySourceOfTruth::<u32, String>::one_shot());
        let store = Store::builder(fetcher_fn(|_key: u32| async move { Ok("v".to_string()) }))
            .source_of_truth(Arc::clone(&sot))
            .build()
            .unwrap();
        store.get(1).await.unwrap();
        assert_eq!(sot.peek(&1), Some("v".to_string()));

        store.clear(&1).await.unwrap();
        assert_eq!(sot.peek(&1), None);
        assert_eq!(store.memory_stats().map(|s| s.entry_count), Some(0));
    }

    #[test]
    fn test_build_rejects_piggybacking() {
        let result: StrataResult<Store<u32, String>> =
            Store::builder(fetcher_fn(|_key: u32| async move { Ok("v".to_string()) }))
                .multicast(MulticastConfig::new().with_piggybacking_downstream(true))
                .build();
        assert!(matches!(result, Err(strata_core::StrataError::Config(_))));
    }

    #[test]
    fn test_build_rejects_weight_without_weigher() {
        let result: StrataResult<Store<u32, String>> =
            Store::builder(fetcher_fn(|_key: u32| async move { Ok("v".to_string()) }))
                .memory_policy(MemoryPolicy::new().with_max_weight(10))
                .build();
        assert!(result.is_err());
    }
}
