//! STRATA Core - Shared Types
//!
//! Request, response and write types shared by every tier, the error
//! taxonomy, and configuration. All other crates depend on this.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::hash::Hash;

pub mod config;
pub mod error;
pub mod request;
pub mod response;
pub mod write;

pub use config::{MemoryPolicy, MulticastConfig};
pub use error::{
    describe_key, ConcurrencyError, ConfigError, ConflictError, FetchError, PersistenceError,
    StrataError, StrataResult,
};
pub use request::{OnReadCompletion, SkippedTiers, StoreReadRequest};
pub use response::{ReadCompletion, ResponseError, ResponseOrigin, StoreReadResponse};
pub use write::{
    logical_now, EagerConflictResolutionResult, OnWriteCompletion, StoreWriteRequest,
    StoreWriteResponse, UpdaterResult,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Bounds every store key satisfies.
pub trait StoreKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> StoreKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds every stored value satisfies.
pub trait StoreValue: Clone + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Send + Sync + 'static {}
