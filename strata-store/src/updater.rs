//! Posting local writes to the remote.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use strata_core::{StoreKey, StoreValue, UpdaterResult};

/// Sends a locally written value to the remote.
#[async_trait]
pub trait Updater<K, V, R>: Send + Sync {
    async fn post(&self, key: &K, value: &V) -> UpdaterResult<R>;
}

#[async_trait]
impl<K, V, R, T> Updater<K, V, R> for Arc<T>
where
    T: Updater<K, V, R> + ?Sized,
    K: Sync,
    V: Sync,
{
    async fn post(&self, key: &K, value: &V) -> UpdaterResult<R> {
        (**self).post(key, value).await
    }
}

/// Updater backed by an async function.
pub struct FnUpdater<F, K, V> {
    post: F,
    _marker: PhantomData<fn(K, V)>,
}

/// Build an updater from `async fn(key, value) -> UpdaterResult<response>`.
pub fn updater_fn<K, V, R, F, Fut>(post: F) -> FnUpdater<F, K, V>
where
    F: Fn(K, V) -> Fut + Send + Sync,
    Fut: Future<Output = UpdaterResult<R>> + Send + 'static,
{
    FnUpdater {
        post,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<K, V, R, F, Fut> Updater<K, V, R> for FnUpdater<F, K, V>
where
    F: Fn(K, V) -> Fut + Send + Sync,
    Fut: Future<Output = UpdaterResult<R>> + Send + 'static,
    K: StoreKey,
    V: StoreValue,
    R: Send + 'static,
{
    async fn post(&self, key: &K, value: &V) -> UpdaterResult<R> {
        (self.post)(key.clone(), value.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ResponseError;

    #[tokio::test]
    async fn test_updater_fn_passes_key_and_value() {
        let updater = updater_fn(|key: u32, value: String| async move {
            if value.is_empty() {
                UpdaterResult::Error(ResponseError::Message("empty".to_string()))
            } else {
                UpdaterResult::Success(format!("{key}:{value}"))
            }
        });

        assert_eq!(
            updater.post(&1, &"a".to_string()).await,
            UpdaterResult::Success("1:a".to_string())
        );
        assert!(!updater.post(&1, &String::new()).await.is_success());
    }
}
