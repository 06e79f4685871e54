//! STRATA Test Utilities
//!
//! Shared test infrastructure for the STRATA workspace:
//! - Mock fetchers, updaters and sources of truth with call recording
//! - Proptest generators for configuration
//! - Fixtures and tracing setup
//! - Assertions over read responses

pub use strata_core::{
    ConfigError, FetchError, MemoryPolicy, MulticastConfig, PersistenceError, ResponseError,
    ResponseOrigin, StoreKey, StoreReadResponse, StoreValue, StrataError, StrataResult,
    UpdaterResult,
};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use parking_lot::Mutex;
use strata_store::{Fetcher, FetcherResult, InMemorySourceOfTruth, SourceOfTruth, Updater};

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// What one call to a [`ScriptedFetcher`] produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStep<V> {
    Value(V),
    Values(Vec<V>),
    /// An empty stream.
    Empty,
    Fail(String),
}

/// Fetcher that plays a script, one step per call.
///
/// Calls past the end of the script repeat the last step. An empty script
/// behaves like `FetchStep::Empty`.
#[derive(Debug)]
pub struct ScriptedFetcher<V> {
    steps: Vec<FetchStep<V>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    name: Option<String>,
}

impl<V: StoreValue> ScriptedFetcher<V> {
    pub fn new(steps: Vec<FetchStep<V>>) -> Self {
        Self {
            steps,
            calls: AtomicUsize::new(0),
            delay: None,
            name: None,
        }
    }

    /// Returns the given values in order, one per call.
    pub fn values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
    {
        Self::new(values.into_iter().map(FetchStep::Value).collect())
    }

    /// Wait this long before producing anything.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of times `fetch` has been called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn step(&self, call: usize) -> FetchStep<V> {
        match self.steps.len() {
            0 => FetchStep::Empty,
            len => self.steps[call.min(len - 1)].clone(),
        }
    }
}

impl<K: StoreKey, V: StoreValue> Fetcher<K, V> for ScriptedFetcher<V> {
    fn fetch(&self, _key: K) -> BoxStream<'static, FetcherResult<V>> {
        let step = self.step(self.calls.fetch_add(1, Ordering::SeqCst));
        let delay = self.delay;
        let origin_name = self.name.clone();
        stream::once(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            step
        })
        .flat_map(move |step| {
            let results: Vec<FetcherResult<V>> = match step {
                FetchStep::Value(value) => vec![FetcherResult::Data {
                    value,
                    origin_name: origin_name.clone(),
                }],
                FetchStep::Values(values) => values
                    .into_iter()
                    .map(|value| FetcherResult::Data {
                        value,
                        origin_name: origin_name.clone(),
                    })
                    .collect(),
                FetchStep::Empty => Vec::new(),
                FetchStep::Fail(reason) => vec![FetcherResult::Error(ResponseError::Exception(
                    FetchError::Failed { reason }.into(),
                ))],
            };
            stream::iter(results)
        })
        .boxed()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

// ============================================================================
// MOCK UPDATER
// ============================================================================

/// Updater that records every post and answers with a version number.
#[derive(Debug)]
pub struct RecordingUpdater<K, V> {
    posts: Mutex<Vec<(K, V)>>,
    accept: AtomicBool,
    version: AtomicU64,
}

impl<K: StoreKey, V: StoreValue> RecordingUpdater<K, V> {
    pub fn accepting() -> Self {
        Self::with_acceptance(true)
    }

    pub fn rejecting() -> Self {
        Self::with_acceptance(false)
    }

    fn with_acceptance(accept: bool) -> Self {
        Self {
            posts: Mutex::new(Vec::new()),
            accept: AtomicBool::new(accept),
            version: AtomicU64::new(0),
        }
    }

    pub fn set_accepting(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// Every post so far, accepted or not.
    pub fn posts(&self) -> Vec<(K, V)> {
        self.posts.lock().clone()
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().len()
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> Updater<K, V, u64> for RecordingUpdater<K, V> {
    async fn post(&self, key: &K, value: &V) -> UpdaterResult<u64> {
        self.posts.lock().push((key.clone(), value.clone()));
        if self.accept.load(Ordering::SeqCst) {
            UpdaterResult::Success(self.version.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            UpdaterResult::Error(ResponseError::Message("remote unavailable".to_string()))
        }
    }
}

// ============================================================================
// MOCK SOURCE OF TRUTH
// ============================================================================

/// In-memory source of truth whose writes can be made to fail.
pub struct FlakySourceOfTruth<K, V> {
    inner: InMemorySourceOfTruth<K, V>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl<K: StoreKey, V: std::fmt::Debug> std::fmt::Debug for FlakySourceOfTruth<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakySourceOfTruth")
            .field("inner", &self.inner)
            .field("fail_writes", &self.fail_writes)
            .field("writes", &self.writes)
            .finish()
    }
}

impl<K: StoreKey, V: StoreValue> FlakySourceOfTruth<K, V> {
    pub fn observable() -> Self {
        Self::wrap(InMemorySourceOfTruth::observable())
    }

    pub fn one_shot() -> Self {
        Self::wrap(InMemorySourceOfTruth::one_shot())
    }

    fn wrap(inner: InMemorySourceOfTruth<K, V>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.peek(key)
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> SourceOfTruth<K, V> for FlakySourceOfTruth<K, V> {
    fn reader(&self, key: &K) -> BoxStream<'static, StrataResult<Option<V>>> {
        self.inner.reader(key)
    }

    async fn write(&self, key: &K, value: &V) -> StrataResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed {
                key: format!("{:?}", key),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        self.inner.write(key, value).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &K) -> StrataResult<()> {
        self.inner.delete(key).await
    }

    async fn delete_all(&self) -> StrataResult<()> {
        self.inner.delete_all().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for STRATA configuration.

    use super::*;
    use proptest::prelude::*;

    /// Memory policies that pass validation.
    pub fn arb_memory_policy() -> impl Strategy<Value = MemoryPolicy> {
        (
            prop_oneof![
                Just((None, None)),
                (1u64..1_000).prop_map(|size| (Some(size), None)),
                (1u64..10_000).prop_map(|weight| (None, Some(weight))),
            ],
            prop_oneof![
                Just((None, None)),
                (1u64..60_000).prop_map(|ms| (Some(Duration::from_millis(ms)), None)),
                (1u64..60_000).prop_map(|ms| (None, Some(Duration::from_millis(ms)))),
            ],
        )
            .prop_map(|((max_size, max_weight), (after_write, after_access))| MemoryPolicy {
                max_size,
                max_weight,
                expire_after_write: after_write,
                expire_after_access: after_access,
            })
    }

    /// Multicast configurations that pass validation.
    pub fn arb_multicast_config() -> impl Strategy<Value = MulticastConfig> {
        (0usize..8, any::<bool>(), any::<bool>(), 1usize..4, 1usize..32).prop_map(
            |(buffer_size, keep_alive, piggybacking, min_acks, downstream_capacity)| MulticastConfig {
                buffer_size,
                keep_upstream_alive: keep_alive && buffer_size > 0,
                piggybacking_downstream: piggybacking,
                min_acks,
                downstream_capacity,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common setup for store tests.

    use super::*;

    /// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
    /// Safe to call from every test.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// A small size-bounded policy without expiry.
    pub fn small_memory_policy() -> MemoryPolicy {
        MemoryPolicy::new().with_max_size(16)
    }

    /// Fetcher returning "A" on the first call and "B" on every later one.
    pub fn a_then_b() -> ScriptedFetcher<String> {
        ScriptedFetcher::values(["A".to_string(), "B".to_string()])
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over store responses and results.

    use super::*;

    /// Assert that `response` is data with the given value and origin.
    #[track_caller]
    pub fn assert_data<V: PartialEq + std::fmt::Debug>(
        response: &StoreReadResponse<V>,
        value: &V,
        origin: ResponseOrigin,
    ) {
        match response {
            StoreReadResponse::Data {
                value: got,
                origin: got_origin,
            } => {
                assert_eq!(got, value, "Wrong value");
                assert_eq!(*got_origin, origin, "Wrong origin");
            }
            other => panic!("Expected Data({:?}, {:?}), got: {:?}", value, origin, other),
        }
    }

    /// Assert the origins of a response sequence, in order.
    #[track_caller]
    pub fn assert_origins<V: std::fmt::Debug>(
        responses: &[StoreReadResponse<V>],
        origins: &[ResponseOrigin],
    ) {
        let got: Vec<ResponseOrigin> = responses.iter().map(|r| r.origin()).collect();
        assert_eq!(got, origins, "Wrong origins for {:?}", responses);
    }

    /// Assert that a StrataResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a StrataResult is a NoData fetch error.
    #[track_caller]
    pub fn assert_no_data<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Fetch(FetchError::NoData { .. })) => {}
            other => panic!("Expected NoData error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
