//! Remote data sources.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use strata_core::{ResponseError, StoreKey, StoreValue, StrataResult};
use tracing::warn;

/// One item produced by a [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetcherResult<V> {
    Data {
        value: V,
        /// Name of the fetcher that produced the value, when it has one.
        origin_name: Option<String>,
    },
    Error(ResponseError),
}

impl<V> FetcherResult<V> {
    pub fn data(value: V) -> Self {
        FetcherResult::Data {
            value,
            origin_name: None,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, FetcherResult::Data { .. })
    }
}

/// Produces values for a key from the remote.
///
/// `fetch` returns a fresh stream on every call. An empty stream means the
/// remote had nothing new to say.
pub trait Fetcher<K, V>: Send + Sync {
    fn fetch(&self, key: K) -> BoxStream<'static, FetcherResult<V>>;

    /// Optional name used to tag data and in log output.
    fn name(&self) -> Option<&str> {
        None
    }
}

impl<K, V, T> Fetcher<K, V> for Arc<T>
where
    T: Fetcher<K, V> + ?Sized,
{
    fn fetch(&self, key: K) -> BoxStream<'static, FetcherResult<V>> {
        (**self).fetch(key)
    }

    fn name(&self) -> Option<&str> {
        (**self).name()
    }
}

// ============================================================================
// CLOSURE ADAPTERS
// ============================================================================

/// Fetcher backed by an async function returning a single value.
pub struct FnFetcher<F, K, V> {
    fetch: F,
    name: Option<String>,
    _marker: PhantomData<fn(K) -> V>,
}

/// Build a fetcher from `async fn(key) -> StrataResult<value>`.
pub fn fetcher_fn<K, V, F, Fut>(fetch: F) -> FnFetcher<F, K, V>
where
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = StrataResult<V>> + Send + 'static,
{
    FnFetcher {
        fetch,
        name: None,
        _marker: PhantomData,
    }
}

impl<F, K, V> FnFetcher<F, K, V> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<F, K, V, Fut> Fetcher<K, V> for FnFetcher<F, K, V>
where
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = StrataResult<V>> + Send + 'static,
    K: StoreKey,
    V: StoreValue,
{
    fn fetch(&self, key: K) -> BoxStream<'static, FetcherResult<V>> {
        let pending = (self.fetch)(key);
        let origin_name = self.name.clone();
        stream::once(async move {
            match pending.await {
                Ok(value) => FetcherResult::Data { value, origin_name },
                Err(error) => FetcherResult::Error(ResponseError::Exception(error)),
            }
        })
        .boxed()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Fetcher backed by a function returning a stream of values.
pub struct StreamFetcher<F, K, V> {
    fetch: F,
    name: Option<String>,
    _marker: PhantomData<fn(K) -> V>,
}

/// Build a fetcher from `fn(key) -> impl Stream<Item = StrataResult<value>>`.
pub fn fetcher_stream_fn<K, V, F, S>(fetch: F) -> StreamFetcher<F, K, V>
where
    F: Fn(K) -> S + Send + Sync,
    S: Stream<Item = StrataResult<V>> + Send + 'static,
{
    StreamFetcher {
        fetch,
        name: None,
        _marker: PhantomData,
    }
}

impl<F, K, V> StreamFetcher<F, K, V> {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<F, K, V, S> Fetcher<K, V> for StreamFetcher<F, K, V>
where
    F: Fn(K) -> S + Send + Sync,
    S: Stream<Item = StrataResult<V>> + Send + 'static,
    K: StoreKey,
    V: StoreValue,
{
    fn fetch(&self, key: K) -> BoxStream<'static, FetcherResult<V>> {
        let origin_name = self.name.clone();
        (self.fetch)(key)
            .map(move |item| match item {
                Ok(value) => FetcherResult::Data {
                    value,
                    origin_name: origin_name.clone(),
                },
                Err(error) => FetcherResult::Error(ResponseError::Exception(error)),
            })
            .boxed()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

// ============================================================================
// FALLBACK
// ============================================================================

/// Switches to a second fetcher when the first fails before producing any
/// data. Errors after data has been produced are passed through.
pub struct FallbackFetcher<K, V> {
    primary: Arc<dyn Fetcher<K, V>>,
    fallback: Arc<dyn Fetcher<K, V>>,
}

impl<K, V> FallbackFetcher<K, V> {
    pub fn new(primary: Arc<dyn Fetcher<K, V>>, fallback: Arc<dyn Fetcher<K, V>>) -> Self {
        Self { primary, fallback }
    }
}

impl<K: StoreKey, V: StoreValue> Fetcher<K, V> for FallbackFetcher<K, V> {
    fn fetch(&self, key: K) -> BoxStream<'static, FetcherResult<V>> {
        let mut primary = self.primary.fetch(key.clone());
        let fallback = Arc::clone(&self.fallback);
        async_stream::stream! {
            let mut produced = false;
            let mut failed = None;
            while let Some(result) = primary.next().await {
                match result {
                    FetcherResult::Error(error) if !produced => {
                        failed = Some(error);
                        break;
                    }
                    other => {
                        produced = true;
                        yield other;
                    }
                }
            }
            if let Some(error) = failed {
                warn!(
                    key = ?key,
                    fallback = fallback.name().unwrap_or("unnamed"),
                    error = %error.message(),
                    "Primary fetcher failed, using fallback"
                );
                let mut secondary = fallback.fetch(key);
                while let Some(result) = secondary.next().await {
                    yield result;
                }
            }
        }
        .boxed()
    }

    fn name(&self) -> Option<&str> {
        self.primary.name()
    }
}

/// Combinators available on every sized fetcher.
pub trait FetcherExt<K, V>: Fetcher<K, V> + Sized + 'static {
    /// Use `fallback` when this fetcher fails before producing data.
    fn with_fallback<F>(self, fallback: F) -> FallbackFetcher<K, V>
    where
        F: Fetcher<K, V> + 'static,
    {
        FallbackFetcher::new(Arc::new(self), Arc::new(fallback))
    }
}

impl<K, V, T> FetcherExt<K, V> for T where T: Fetcher<K, V> + Sized + 'static {}

// =============================================================================
// TESTS
// =============================================================================
