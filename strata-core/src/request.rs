//! Read requests.

use crate::response::ReadCompletion;
use std::fmt;
use std::sync::Arc;

/// Callback invoked for every terminal emission of a read stream.
pub type OnReadCompletion = Arc<dyn Fn(ReadCompletion) + Send + Sync>;

/// Tiers a request may skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkippedTiers {
    pub memory: bool,
    pub source_of_truth: bool,
}

/// A read request for one key.
///
/// Use the factory functions rather than building one field by field:
/// `cached` for the common case, `fresh` to force the fetcher, `local_only`
/// to never touch the network.
#[derive(Clone)]
pub struct StoreReadRequest<K> {
    pub key: K,
    /// Force a fetch even when a tier already has data.
    pub refresh: bool,
    pub skipped: SkippedTiers,
    /// On fetch failure, fall back to the source of truth.
    pub fallback_to_source_of_truth: bool,
    /// Never start a fetch.
    pub local_only: bool,
    pub on_complete: Option<OnReadCompletion>,
}

impl<K> StoreReadRequest<K> {
    /// Serve from cache or source of truth when possible.
    pub fn cached(key: K, refresh: bool) -> Self {
        Self {
            key,
            refresh,
            skipped: SkippedTiers::default(),
            fallback_to_source_of_truth: false,
            local_only: false,
            on_complete: None,
        }
    }

    /// Skip memory and source of truth reads and go straight to the fetcher.
    pub fn fresh(key: K) -> Self {
        Self {
            refresh: true,
            skipped: SkippedTiers {
                memory: true,
                source_of_truth: true,
            },
            ..Self::cached(key, true)
        }
    }

    /// Like [`fresh`](Self::fresh), but a failed fetch falls back to the
    /// source of truth value.
    pub fn fresh_with_fallback(key: K) -> Self {
        Self {
            fallback_to_source_of_truth: true,
            ..Self::fresh(key)
        }
    }

    /// Skip the memory cache, read the source of truth.
    pub fn skip_memory(key: K, refresh: bool) -> Self {
        Self {
            skipped: SkippedTiers {
                memory: true,
                source_of_truth: false,
            },
            ..Self::cached(key, refresh)
        }
    }

    /// Serve only from local tiers.
    pub fn local_only(key: K) -> Self {
        Self {
            local_only: true,
            ..Self::cached(key, false)
        }
    }

    pub fn with_on_complete(mut self, callback: OnReadCompletion) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn skips_memory(&self) -> bool {
        self.skipped.memory
    }

    pub fn skips_source_of_truth(&self) -> bool {
        self.skipped.source_of_truth
    }

    pub(crate) fn notify(&self, completion: ReadCompletion) {
        if let Some(callback) = &self.on_complete {
            callback(completion);
        }
    }

    /// Invoke the completion callback if `response` is terminal.
    pub fn complete_with<V>(&self, response: &crate::StoreReadResponse<V>) {
        if let Some(completion) = response.completion() {
            self.notify(completion);
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for StoreReadRequest<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreReadRequest")
            .field("key", &self.key)
            .field("refresh", &self.refresh)
            .field("skipped", &self.skipped)
            .field("fallback_to_source_of_truth", &self.fallback_to_source_of_truth)
            .field("local_only", &self.local_only)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{ResponseOrigin, StoreReadResponse};
    use std::sync::Mutex;

    #[test]
    fn test_fresh_skips_both_local_tiers() {
        let request = StoreReadRequest::fresh(1u32);
        assert!(request.refresh);
        assert!(request.skips_memory());
        assert!(request.skips_source_of_truth());
        assert!(!request.fallback_to_source_of_truth);
    }

    #[test]
    fn test_skip_memory_keeps_source_of_truth() {
        let request = StoreReadRequest::skip_memory(1u32, false);
        assert!(request.skips_memory());
        assert!(!request.skips_source_of_truth());
        assert!(!request.refresh);
    }

    #[test]
    fn test_completion_callback_only_fires_on_terminal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let request = StoreReadRequest::cached("k", false).with_on_complete(Arc::new(
            move |completion: ReadCompletion| sink.lock().unwrap().push(completion),
        ));

        request.complete_with(&StoreReadResponse::<u8>::Loading {
            origin: ResponseOrigin::Fetcher,
        });
        request.complete_with(&StoreReadResponse::Data {
            value: 1u8,
            origin: ResponseOrigin::Cache,
        });

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![ReadCompletion::Success {
                origin: ResponseOrigin::Cache
            }]
        );
    }

    #[test]
    fn test_debug_hides_callback() {
        let request =
            StoreReadRequest::local_only(3u8).with_on_complete(Arc::new(|_: ReadCompletion| {}));
        let rendered = format!("{:?}", request);
        assert!(rendered.contains("local_only: true"));
        assert!(rendered.contains("on_complete: true"));
    }
}
