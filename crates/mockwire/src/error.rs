//! Error taxonomy for the mock service core.
//!
//! - `StoreError`: a shared-store round-trip failed or timed out.
//! - `RepositoryError`: a mock write was not applied atomically; surfaced to the caller.
//! - `ParseError`: a body could not be decoded; recovered inside the body classifier.
//! - `DispatchError`: resolution or rendering failed; recovered to passthrough.
//! - `SyncError`: a broadcast event could not be applied; logged, cache left stale.
//! - `ServiceError`: dashboard-facing failures.

/// Errors raised by `KvStore` backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation '{0}' timed out")]
    Timeout(&'static str),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("value under key '{0}' is not an integer")]
    NotAnInteger(String),
    #[error("value under key '{0}' holds the wrong kind of value")]
    WrongType(String),
    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Errors raised while writing or reading mock records.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Failed to set mock with key {0}")]
    AtomicWriteFailed(String),
    #[error("Invalid mock payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body decoding failures. Never escapes the body classifier.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read body: {0}")]
    Read(String),
    #[error("failed to decompress body: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures inside the dispatch pipeline. Always recovered to passthrough.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("failed to build response: {0}")]
    Response(#[from] hyper::http::Error),
    #[error("failed to encode response body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures while handling a cross-instance event.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("malformed event message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid blacklist rule '{source_text}': {reason}")]
    InvalidRule { source_text: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by dashboard and service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Mocking service is disabled. Please enable it first.")]
    Disabled,
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid blacklist rule: {0}")]
    InvalidRule(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
