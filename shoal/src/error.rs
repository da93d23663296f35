//! Error taxonomy for admission, dispatch and lifecycle operations.
//!
//! Errors fall into two families that callers must keep apart:
//!
//! - **Fatal** configuration errors (an invalid batch size, an out-of-bounds
//!   worker index, a malformed document). Re-running with the same input
//!   reproduces them, so the runtime surfaces them and stops requeueing.
//! - **Retryable** errors (object-store outages, exhausted version-conflict
//!   retries, discovery failures). The runtime requeues these with backoff.
//!
//! Not-found and already-exists outcomes are modelled on [`StoreError`] so
//! every layer can turn them into no-op successes explicitly.

use crate::partition::PartitionStrategy;
use crate::resource::ObjectKey;

/// The result type used throughout shoal.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by an [`ObjectStore`](crate::store::ObjectStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },

    /// An object with the same key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },

    /// The update was based on a stale resource version.
    #[error("{kind} {key} version conflict: expected {expected}, found {actual}")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The store could not serve the request.
    #[error("object store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// An object could not be encoded or decoded.
    #[error("{kind} codec error: {message}")]
    Codec {
        /// Resource kind.
        kind: &'static str,
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Returns true for [`StoreError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for [`StoreError::AlreadyExists`].
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true for [`StoreError::Conflict`].
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Errors that can occur in shoal operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A partition strategy was configured with a non-positive size.
    #[error("invalid batch size {size} for strategy {strategy}")]
    InvalidBatchSize {
        /// The configured strategy.
        strategy: PartitionStrategy,
        /// The rejected size.
        size: i64,
    },

    /// A worker index does not address any batch.
    #[error("worker index {index} out of bounds for {len} batches")]
    WorkerIndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of batches available.
        len: usize,
    },

    /// A configuration document has the wrong shape.
    #[error("invalid configuration document: {message}")]
    InvalidDocument {
        /// Description of the problem.
        message: String,
    },

    /// An object-store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Version conflicts persisted after every retry.
    #[error("gave up on {key} after {attempts} conflicting updates")]
    ConflictRetriesExhausted {
        /// Object key.
        key: ObjectKey,
        /// Attempts made.
        attempts: u32,
    },

    /// Repository discovery failed.
    #[error("repository discovery failed: {message}")]
    Discovery {
        /// Description of the failure.
        message: String,
    },

    /// A JSON document could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns true when retrying with unchanged input cannot succeed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidBatchSize { .. }
                | Self::WorkerIndexOutOfBounds { .. }
                | Self::InvalidDocument { .. }
                | Self::Serialization(_)
        ) || matches!(self, Self::Store(StoreError::Codec { .. }))
    }

    /// Returns true when the operation should be retried after backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        if self.is_fatal() { "fatal" } else { "retryable" }
    }

    /// Creates an invalid-document error.
    #[must_use]
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Creates a discovery error.
    #[must_use]
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }
}
