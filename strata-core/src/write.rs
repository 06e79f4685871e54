//! Write path types: requests, updater outcomes and reconciliation results.

use crate::response::ResponseError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static LOGICAL_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Next tick of the process-wide logical clock.
///
/// Strictly increasing across threads. Used to order queued writes against
/// each other and against values received from the fetcher.
pub fn logical_now() -> u64 {
    LOGICAL_CLOCK.fetch_add(1, Ordering::SeqCst)
}

/// Result of posting a value to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdaterResult<R> {
    Success(R),
    Error(ResponseError),
}

impl<R> UpdaterResult<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdaterResult::Success(_))
    }
}

/// Result of a write as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWriteResponse<R> {
    Success(R),
    Error(ResponseError),
}

impl<R> From<UpdaterResult<R>> for StoreWriteResponse<R> {
    fn from(result: UpdaterResult<R>) -> Self {
        match result {
            UpdaterResult::Success(response) => StoreWriteResponse::Success(response),
            UpdaterResult::Error(error) => StoreWriteResponse::Error(error),
        }
    }
}

impl<R> StoreWriteResponse<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, StoreWriteResponse::Success(_))
    }
}

/// Outcome of eager conflict resolution before a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EagerConflictResolutionResult<R> {
    /// Nothing pending for the key.
    NoConflicts,
    /// Pending local state was posted and accepted.
    ConflictsResolved(R),
    Error(ResponseError),
}

/// Callback invoked once a queued write has been reconciled.
pub type OnWriteCompletion<R> = Arc<dyn Fn(&StoreWriteResponse<R>) + Send + Sync>;

/// A local write awaiting reconciliation with the remote.
pub struct StoreWriteRequest<K, V, R> {
    pub key: K,
    pub value: V,
    /// Logical timestamp from [`logical_now`].
    pub created: u64,
    pub on_completions: Vec<OnWriteCompletion<R>>,
}

impl<K, V, R> StoreWriteRequest<K, V, R> {
    pub fn of(key: K, value: V) -> Self {
        Self {
            key,
            value,
            created: logical_now(),
            on_completions: Vec::new(),
        }
    }

    pub fn with_on_completion(mut self, callback: OnWriteCompletion<R>) -> Self {
        self.on_completions.push(callback);
        self
    }

    pub fn complete(&self, response: &StoreWriteResponse<R>) {
        for callback in &self.on_completions {
            callback(response);
        }
    }
}

impl<K: Clone, V: Clone, R> Clone for StoreWriteRequest<K, V, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            created: self.created,
            on_completions: self.on_completions.iter().map(Arc::clone).collect(),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, R> fmt::Debug for StoreWriteRequest<K, V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWriteRequest")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("created", &self.created)
            .field("on_completions", &self.on_completions.len())
            .finish()
    }
}
