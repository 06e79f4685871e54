//! STRATA Store - Read Pipeline and Write Reconciliation
//!
//! A [`Store`] answers reads from memory, then from a durable source of
//! truth, then from the remote through a [`Fetcher`]. A [`MutableStore`]
//! adds optimistic local writes that are posted to the remote through an
//! [`Updater`] and retried after failure.
//!
//! # Design
//!
//! - Concurrent reads of a key share one fetch. Each fetched value is
//!   written to the source of truth and memory before any reader sees it.
//! - Per-key [`ThreadSafetyController`] rooms keep local writes from
//!   interleaving with fetch persistence. Reads of different keys never
//!   contend.
//! - Writes apply locally first and queue per key. A successful post of the
//!   newest queued value settles every earlier request. A failed post is
//!   recorded with the [`Bookkeeper`] and retried before the next read.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::builder(fetcher_fn(|id: u64| async move { api.user(id).await }))
//!     .source_of_truth(InMemorySourceOfTruth::observable())
//!     .memory_policy(MemoryPolicy::new().with_max_size(500))
//!     .build()?;
//!
//! let user = store.get(42).await?;
//! let mut updates = store.stream(StoreReadRequest::cached(42, true));
//! while let Some(response) = updates.next().await {
//!     // Cache, then Loading, then fresh Data from the fetcher
//! }
//! ```

mod bookkeeper;
mod fetcher;
mod fetcher_controller;
mod lightswitch;
mod mutable;
mod source_of_truth;
mod store;
mod thread_safety;
mod tiers;
mod updater;
mod validator;

pub use bookkeeper::{Bookkeeper, InMemoryBookkeeper};
pub use fetcher::{
    fetcher_fn, fetcher_stream_fn, FallbackFetcher, Fetcher, FetcherExt, FetcherResult,
    FnFetcher, StreamFetcher,
};
pub use lightswitch::{Gate, Lightswitch, LightswitchGuard};
pub use mutable::{MergeOutcome, MergePolicy, MutableStore, MutableStoreBuilder, PendingWrite};
pub use source_of_truth::{InMemorySourceOfTruth, MappedSourceOfTruth, SourceOfTruth};
pub use store::{default_memory_policy, Store, StoreBuilder};
pub use thread_safety::{ThreadSafety, ThreadSafetyController};
pub use tiers::RemoteSnapshot;
pub use updater::{updater_fn, FnUpdater, Updater};
pub use validator::{validator_fn, FnValidator, Validator};

// Re-export the shared types so most callers need only this crate.
pub use strata_core::{
    EagerConflictResolutionResult, MemoryPolicy, MulticastConfig, ReadCompletion, ResponseError,
    ResponseOrigin, StoreReadRequest, StoreReadResponse, StoreWriteRequest, StoreWriteResponse,
    StrataError, StrataResult, UpdaterResult,
};
