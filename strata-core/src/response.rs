//! Read responses emitted by a store stream.

use crate::error::{FetchError, PersistenceError, StrataError, StrataResult};
use serde::{Deserialize, Serialize};

/// Which tier produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseOrigin {
    /// In-memory cache
    Cache,
    /// Durable local tier
    SourceOfTruth,
    /// Remote fetch
    Fetcher,
    /// Optimistic local write, not yet acknowledged by the remote
    LocalWrite,
}

/// Failure payload carried by responses, fetcher results and updater results.
///
/// `Exception` wraps a typed error; `Message` carries a plain reason reported
/// by a collaborator that has no error value to hand over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    Exception(StrataError),
    Message(String),
}

impl ResponseError {
    /// Human-readable description of the failure.
    pub fn message(&self) -> String {
        match self {
            ResponseError::Exception(error) => error.to_string(),
            ResponseError::Message(text) => text.clone(),
        }
    }

    /// Convert into a typed error, attributing plain messages to the tier
    /// that reported them.
    pub fn into_error(self, origin: ResponseOrigin) -> StrataError {
        match self {
            ResponseError::Exception(error) => error,
            ResponseError::Message(message) => match origin {
                ResponseOrigin::SourceOfTruth => PersistenceError::Message { message }.into(),
                _ => FetchError::Message { message }.into(),
            },
        }
    }
}

impl From<StrataError> for ResponseError {
    fn from(error: StrataError) -> Self {
        ResponseError::Exception(error)
    }
}

/// One emission of a store read stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReadResponse<V> {
    /// A fetch has started.
    Loading { origin: ResponseOrigin },
    /// A value is available.
    Data { value: V, origin: ResponseOrigin },
    /// The fetch completed without producing a value.
    NoNewData { origin: ResponseOrigin },
    /// A tier failed.
    Error {
        origin: ResponseOrigin,
        error: ResponseError,
    },
}

impl<V> StoreReadResponse<V> {
    pub fn origin(&self) -> ResponseOrigin {
        match self {
            StoreReadResponse::Loading { origin }
            | StoreReadResponse::Data { origin, .. }
            | StoreReadResponse::NoNewData { origin }
            | StoreReadResponse::Error { origin, .. } => *origin,
        }
    }

    /// Data, NoNewData and Error end one fetch attempt; Loading does not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StoreReadResponse::Loading { .. })
    }

    pub fn data(&self) -> Option<&V> {
        match self {
            StoreReadResponse::Data { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<V> {
        match self {
            StoreReadResponse::Data { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Returns the value, or the carried error for `Error` responses.
    ///
    /// `Loading` and `NoNewData` have no value and report `FetchError::NoData`.
    pub fn require_data(self) -> StrataResult<V> {
        match self {
            StoreReadResponse::Data { value, .. } => Ok(value),
            StoreReadResponse::Error { origin, error } => Err(error.into_error(origin)),
            other => Err(FetchError::NoData {
                key: format!("<{:?} response>", other.origin()),
            }
            .into()),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            StoreReadResponse::Error { error, .. } => Some(error.message()),
            _ => None,
        }
    }

    /// Summary handed to per-request completion callbacks.
    pub fn completion(&self) -> Option<ReadCompletion> {
        match self {
            StoreReadResponse::Loading { .. } => None,
            StoreReadResponse::Data { origin, .. } | StoreReadResponse::NoNewData { origin } => {
                Some(ReadCompletion::Success { origin: *origin })
            }
            StoreReadResponse::Error { origin, error } => Some(ReadCompletion::Failure {
                origin: *origin,
                message: error.message(),
            }),
        }
    }
}

/// Outcome passed to a read request's completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCompletion {
    Success { origin: ResponseOrigin },
    Failure { origin: ResponseOrigin, message: String },
}
