//! Optimistic local writes reconciled with the remote through an
//! [`Updater`].
//!
//! A write lands in the local tiers immediately and joins a per-key queue.
//! Posting the newest queued value settles every request queued at or
//! before it. Failed posts are recorded with the [`Bookkeeper`] and retried
//! by eager conflict resolution on the next read. Reads of a key with
//! queued writes report their values as [`ResponseOrigin::LocalWrite`].

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use strata_core::{
    describe_key, logical_now, ConcurrencyError, ConflictError, EagerConflictResolutionResult,
    ResponseError, ResponseOrigin, StoreKey, StoreReadRequest, StoreReadResponse, StoreValue,
    StoreWriteRequest, StoreWriteResponse, StrataResult, UpdaterResult,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bookkeeper::Bookkeeper;
use crate::store::{first_data, Store};
use crate::updater::Updater;

// ============================================================================
// MERGE POLICY
// ============================================================================

/// Decision taken when the remote changed after a local write was queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome<V> {
    /// Post this value instead of the local one.
    Merged(V),
    /// Post the local value as is.
    KeepLocal,
    /// Do not post; the write stays queued.
    Reject(String),
}

/// Resolves a local value against a newer remote one.
pub trait MergePolicy<K, V>: Send + Sync {
    fn merge(&self, key: &K, local: &V, remote: &V) -> MergeOutcome<V>;
}

impl<K, V, F> MergePolicy<K, V> for F
where
    F: Fn(&K, &V, &V) -> MergeOutcome<V> + Send + Sync,
{
    fn merge(&self, key: &K, local: &V, remote: &V) -> MergeOutcome<V> {
        self(key, local, remote)
    }
}

// ============================================================================
// WRITE QUEUE
// ============================================================================

struct QueuedWrite<K, V, R> {
    request: StoreWriteRequest<K, V, R>,
    settled: Option<oneshot::Sender<StoreWriteResponse<R>>>,
}

/// Marks a reconciliation of `key` as running until dropped, including
/// when its task is aborted.
struct Reconciling<K: StoreKey> {
    counts: Arc<DashMap<K, usize>>,
    key: K,
}

impl<K: StoreKey> Reconciling<K> {
    fn begin(counts: &Arc<DashMap<K, usize>>, key: &K) -> Self {
        *counts.entry(key.clone()).or_insert(0) += 1;
        Self {
            counts: Arc::clone(counts),
            key: key.clone(),
        }
    }
}

impl<K: StoreKey> Drop for Reconciling<K> {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(&self.key, |_, count| *count == 0);
    }
}

/// Handle to a write whose reconciliation runs in the background.
#[derive(Debug)]
pub struct PendingWrite<R> {
    task: JoinHandle<StoreWriteResponse<R>>,
}

impl<R> PendingWrite<R> {
    /// Wait for reconciliation to finish.
    pub async fn outcome(self) -> StoreWriteResponse<R> {
        match self.task.await {
            Ok(response) => response,
            Err(error) => StoreWriteResponse::Error(ResponseError::Message(format!(
                "reconciliation did not finish: {error}"
            ))),
        }
    }

    /// Stop reconciling. The local value stays, and the write stays queued
    /// for the next eager conflict resolution.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ============================================================================
// MUTABLE STORE
// ============================================================================

struct MutableInner<K: StoreKey, V: StoreValue, R> {
    store: Store<K, V>,
    updater: Arc<dyn Updater<K, V, R>>,
    bookkeeper: Option<Arc<dyn Bookkeeper<K>>>,
    merge_policy: Option<Arc<dyn MergePolicy<K, V>>>,
    queues: DashMap<K, VecDeque<QueuedWrite<K, V, R>>>,
    reconciling: Arc<DashMap<K, usize>>,
}

/// A [`Store`] that also accepts local writes.
pub struct MutableStore<K: StoreKey, V: StoreValue, R> {
    inner: Arc<MutableInner<K, V, R>>,
}

impl<K: StoreKey, V: StoreValue, R> Clone for MutableStore<K, V, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Assembles a [`MutableStore`].
pub struct MutableStoreBuilder<K: StoreKey, V: StoreValue, R> {
    store: Store<K, V>,
    updater: Arc<dyn Updater<K, V, R>>,
    bookkeeper: Option<Arc<dyn Bookkeeper<K>>>,
    merge_policy: Option<Arc<dyn MergePolicy<K, V>>>,
}

impl<K, V, R> MutableStoreBuilder<K, V, R>
where
    K: StoreKey,
    V: StoreValue,
    R: Clone + Send + Sync + 'static,
{
    /// Record failed posts so they are retried on later reads.
    pub fn bookkeeper<B>(mut self, bookkeeper: B) -> Self
    where
        B: Bookkeeper<K> + 'static,
    {
        self.bookkeeper = Some(Arc::new(bookkeeper));
        self
    }

    /// Resolve local writes against newer remote values. Without one, the
    /// local value wins.
    pub fn merge_policy<P>(mut self, policy: P) -> Self
    where
        P: MergePolicy<K, V> + 'static,
    {
        self.merge_policy = Some(Arc::new(policy));
        self
    }

    pub fn build(self) -> MutableStore<K, V, R> {
        self.store.track_remote();
        MutableStore {
            inner: Arc::new(MutableInner {
                store: self.store,
                updater: self.updater,
                bookkeeper: self.bookkeeper,
                merge_policy: self.merge_policy,
                queues: DashMap::new(),
                reconciling: Arc::new(DashMap::new()),
            }),
        }
    }
}

impl<K, V, R> MutableStore<K, V, R>
where
    K: StoreKey,
    V: StoreValue,
    R: Clone + Send + Sync + 'static,
{
    pub fn new<U>(store: Store<K, V>, updater: U) -> Self
    where
        U: Updater<K, V, R> + 'static,
    {
        Self::builder(store, updater).build()
    }

    pub fn builder<U>(store: Store<K, V>, updater: U) -> MutableStoreBuilder<K, V, R>
    where
        U: Updater<K, V, R> + 'static,
    {
        MutableStoreBuilder {
            store,
            updater: Arc::new(updater),
            bookkeeper: None,
            merge_policy: None,
        }
    }

    pub fn store(&self) -> &Store<K, V> {
        &self.inner.store
    }

    /// Writes queued for `key` and not yet accepted by the remote.
    pub fn pending_writes(&self, key: &K) -> usize {
        self.inner.queues.get(key).map_or(0, |queue| queue.len())
    }

    /// Whether a write of `key` is currently being posted.
    pub fn is_reconciling(&self, key: &K) -> bool {
        self.inner.reconciling.contains_key(key)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Stream responses for `request`, first posting any pending local
    /// state for the key. Local values are tagged
    /// [`ResponseOrigin::LocalWrite`] while writes are queued.
    pub fn stream(&self, request: StoreReadRequest<K>) -> BoxStream<'static, StoreReadResponse<V>> {
        let this = self.clone();
        async_stream::stream! {
            let key = request.key.clone();
            match this.eagerly_resolve_conflicts(&key).await {
                EagerConflictResolutionResult::NoConflicts => {}
                EagerConflictResolutionResult::ConflictsResolved(_) => {
                    debug!(key = ?key, "Resolved pending writes before read");
                }
                EagerConflictResolutionResult::Error(error) => {
                    warn!(key = ?key, error = %error.message(), "Pending writes still unresolved");
                }
            }
            let mut responses = this.inner.store.stream(request);
            while let Some(response) = responses.next().await {
                yield this.mark_unsynced(&key, response);
            }
        }
        .boxed()
    }

    fn mark_unsynced(&self, key: &K, response: StoreReadResponse<V>) -> StoreReadResponse<V> {
        match response {
            StoreReadResponse::Data {
                value,
                origin: ResponseOrigin::Cache | ResponseOrigin::SourceOfTruth,
            } if self.pending_writes(key) > 0 => StoreReadResponse::Data {
                value,
                origin: ResponseOrigin::LocalWrite,
            },
            other => other,
        }
    }

    pub async fn get(&self, key: K) -> StrataResult<V> {
        first_data(self.stream(StoreReadRequest::cached(key.clone(), false)), &key).await
    }

    pub async fn fresh(&self, key: K) -> StrataResult<V> {
        first_data(self.stream(StoreReadRequest::fresh(key.clone())), &key).await
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Apply `request` locally and wait for the remote to accept or reject
    /// it.
    pub async fn write(&self, request: StoreWriteRequest<K, V, R>) -> StoreWriteResponse<R> {
        let key = request.key.clone();
        match self.apply_locally(request).await {
            Ok((settled, reconciling)) => self.reconcile(&key, settled, reconciling).await,
            Err(error) => StoreWriteResponse::Error(ResponseError::Exception(error)),
        }
    }

    /// Apply `request` locally and reconcile it on a background task.
    pub async fn submit(&self, request: StoreWriteRequest<K, V, R>) -> StrataResult<PendingWrite<R>> {
        let handle = Handle::try_current().map_err(|_| ConcurrencyError::NoRuntime {
            task: "write reconciliation".to_string(),
        })?;
        let key = request.key.clone();
        let (settled, reconciling) = self.apply_locally(request).await?;
        let this = self.clone();
        let task = handle.spawn(async move { this.reconcile(&key, settled, reconciling).await });
        Ok(PendingWrite { task })
    }

    /// Write the request's value to the local tiers and queue it, both in
    /// one exclusive section so queue order matches local state.
    ///
    /// The key counts as reconciling from before the value is visible until
    /// the returned marker drops.
    async fn apply_locally(
        &self,
        request: StoreWriteRequest<K, V, R>,
    ) -> StrataResult<(oneshot::Receiver<StoreWriteResponse<R>>, Reconciling<K>)> {
        let key = request.key.clone();
        let value = request.value.clone();
        let (settled_tx, settled_rx) = oneshot::channel();
        let reconciling = Reconciling::begin(&self.inner.reconciling, &key);

        let queues = &self.inner.queues;
        let queue_key = key.clone();
        self.inner
            .store
            .write_local_then(&key, &value, move || {
                queues.entry(queue_key).or_default().push_back(QueuedWrite {
                    request,
                    settled: Some(settled_tx),
                });
            })
            .await?;

        debug!(key = ?key, pending = self.pending_writes(&key), "Applied local write");
        Ok((settled_rx, reconciling))
    }

    /// Post the newest queued value for `key`.
    ///
    /// If an earlier reconciliation already settled this write, its outcome
    /// is returned instead.
    async fn reconcile(
        &self,
        key: &K,
        settled: oneshot::Receiver<StoreWriteResponse<R>>,
        _reconciling: Reconciling<K>,
    ) -> StoreWriteResponse<R> {
        let latest = match self.latest_queued(key).await {
            Ok(latest) => latest,
            Err(error) => return StoreWriteResponse::Error(ResponseError::Exception(error)),
        };
        match latest {
            Some((created, value)) => self.post(key, created, &value).await,
            None => settled.await.unwrap_or_else(|_| {
                StoreWriteResponse::Error(ResponseError::Exception(
                    ConflictError::MissingWrite {
                        key: describe_key(key),
                    }
                    .into(),
                ))
            }),
        }
    }

    async fn latest_queued(&self, key: &K) -> StrataResult<Option<(u64, V)>> {
        let queues = &self.inner.queues;
        self.inner
            .store
            .thread_safety()
            .with_thread_safety(key, || async {
                queues.get(key).and_then(|queue| {
                    queue
                        .back()
                        .map(|write| (write.request.created, write.request.value.clone()))
                })
            })
            .await
    }

    /// Send `value` to the remote and settle the queue on success.
    async fn post(&self, key: &K, created: u64, value: &V) -> StoreWriteResponse<R> {
        match self.inner.updater.post(key, value).await {
            UpdaterResult::Success(response) => {
                let response = StoreWriteResponse::Success(response);
                let settled = self.settle_through(key, created, &response).await;
                if let Some(bookkeeper) = &self.inner.bookkeeper {
                    if let Err(error) = bookkeeper.clear(key).await {
                        warn!(key = ?key, error = %error, "Failed to clear bookkeeping");
                    }
                }
                info!(key = ?key, settled = settled, "Remote accepted local write");
                response
            }
            UpdaterResult::Error(error) => {
                if let Some(bookkeeper) = &self.inner.bookkeeper {
                    if let Err(bookkeeping) = bookkeeper.set_last_failed_sync(key, Utc::now()).await {
                        warn!(key = ?key, error = %bookkeeping, "Failed to record failed sync");
                    }
                }
                warn!(
                    key = ?key,
                    error = %error.message(),
                    pending = self.pending_writes(key),
                    "Remote rejected local write"
                );
                StoreWriteResponse::Error(error)
            }
        }
    }

    /// Remove every queued write created at or before `created` and hand
    /// each one `response`. Returns how many were settled.
    async fn settle_through(&self, key: &K, created: u64, response: &StoreWriteResponse<R>) -> usize {
        let queues = &self.inner.queues;
        let taken = self
            .inner
            .store
            .thread_safety()
            .with_thread_safety(key, || async {
                let mut taken = Vec::new();
                let mut now_empty = false;
                if let Some(mut queue) = queues.get_mut(key) {
                    while queue.front().is_some_and(|write| write.request.created <= created) {
                        if let Some(write) = queue.pop_front() {
                            taken.push(write);
                        }
                    }
                    now_empty = queue.is_empty();
                }
                if now_empty {
                    queues.remove_if(key, |_, queue| queue.is_empty());
                }
                taken
            })
            .await
            .unwrap_or_else(|error| {
                warn!(key = ?key, error = %error, "Could not settle queued writes");
                Vec::new()
            });

        let count = taken.len();
        for mut write in taken {
            write.request.complete(response);
            if let Some(settled) = write.settled.take() {
                let _ = settled.send(response.clone());
            }
        }
        count
    }

    // ========================================================================
    // CONFLICT RESOLUTION
    // ========================================================================

    /// Post pending local state for `key`, if there is any.
    ///
    /// Does nothing while a write of `key` is being posted; that post
    /// carries the newest queued value.
    pub async fn eagerly_resolve_conflicts(&self, key: &K) -> EagerConflictResolutionResult<R> {
        if self.is_reconciling(key) {
            trace!(key = ?key, "Reconciliation in flight; skipping eager resolution");
            return EagerConflictResolutionResult::NoConflicts;
        }
        let failed_sync = match &self.inner.bookkeeper {
            Some(bookkeeper) => match bookkeeper.last_failed_sync(key).await {
                Ok(at) => at,
                Err(error) => return EagerConflictResolutionResult::Error(error.into()),
            },
            None => None,
        };
        let (oldest, newest) = match self.queued_bounds(key).await {
            Ok(bounds) => bounds,
            Err(error) => return EagerConflictResolutionResult::Error(error.into()),
        };
        if failed_sync.is_none() && newest.is_none() {
            return EagerConflictResolutionResult::NoConflicts;
        }

        let local = match newest {
            Some((_, value)) => Some(value),
            None => match self.inner.store.latest(key).await {
                Ok(value) => value,
                Err(error) => return EagerConflictResolutionResult::Error(error.into()),
            },
        };
        let Some(mut local) = local else {
            return EagerConflictResolutionResult::NoConflicts;
        };

        if let (Some(oldest), Some(remote)) = (oldest, self.inner.store.remote_snapshot(key)) {
            if remote.fetched_at > oldest {
                let outcome = match &self.inner.merge_policy {
                    Some(policy) => policy.merge(key, &local, &remote.value),
                    None => MergeOutcome::KeepLocal,
                };
                match outcome {
                    MergeOutcome::KeepLocal => {
                        debug!(key = ?key, "Remote changed after local write; keeping local");
                    }
                    MergeOutcome::Merged(merged) => {
                        if let Err(error) = self.inner.store.write_local(key, &merged).await {
                            return EagerConflictResolutionResult::Error(error.into());
                        }
                        debug!(key = ?key, "Merged local write with newer remote value");
                        local = merged;
                    }
                    MergeOutcome::Reject(reason) => {
                        warn!(key = ?key, reason = %reason, "Merge policy rejected local write");
                        return EagerConflictResolutionResult::Error(ResponseError::Exception(
                            ConflictError::Unresolved {
                                key: describe_key(key),
                                reason,
                            }
                            .into(),
                        ));
                    }
                }
            }
        }

        match self.post(key, logical_now(), &local).await {
            StoreWriteResponse::Success(response) => {
                EagerConflictResolutionResult::ConflictsResolved(response)
            }
            StoreWriteResponse::Error(error) => EagerConflictResolutionResult::Error(error),
        }
    }

    /// Creation time of the oldest queued write and the newest queued write.
    #[allow(clippy::type_complexity)]
    async fn queued_bounds(&self, key: &K) -> StrataResult<(Option<u64>, Option<(u64, V)>)> {
        let queues = &self.inner.queues;
        self.inner
            .store
            .thread_safety()
            .with_thread_safety(key, || async {
                match queues.get(key) {
                    Some(queue) => (
                        queue.front().map(|write| write.request.created),
                        queue
                            .back()
                            .map(|write| (write.request.created, write.request.value.clone())),
                    ),
                    None => (None, None),
                }
            })
            .await
    }

    // ========================================================================
    // CLEARING
    // ========================================================================

    /// Remove `key` from every tier, its queued writes and its bookkeeping.
    pub async fn clear(&self, key: &K) -> StrataResult<()> {
        self.inner.store.clear(key).await?;
        self.inner.queues.remove(key);
        if let Some(bookkeeper) = &self.inner.bookkeeper {
            bookkeeper.clear(key).await?;
        }
        Ok(())
    }

    pub async fn clear_all(&self) -> StrataResult<()> {
        self.inner.store.clear_all().await?;
        self.inner.queues.clear();
        if let Some(bookkeeper) = &self.inner.bookkeeper {
            bookkeeper.clear_all().await?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
