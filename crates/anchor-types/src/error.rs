//! Shared error types for the Memory Anchor system.

use thiserror::Error;

/// Top-level error type for the Memory Anchor system.
#[derive(Error, Debug)]
pub enum AnchorError {
    /// Schema violation, unknown enum value, out-of-range numeric, or
    /// inconsistent time fields.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The safety filter blocked the content.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Confidence below the pending threshold; the memory was not stored.
    #[error("Confidence too low: {0}")]
    LowConfidence(f64),

    /// An optimistic lock miss on a status transition. Retry-eligible.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The id was found in neither store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The vector or metadata store is unreachable. Retry-eligible.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The embedder produced a vector whose dimension does not match the
    /// collection.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension declared by the collection.
        expected: usize,
        /// Dimension actually produced.
        actual: usize,
    },

    /// An identity-schema write was attempted without the required approvals,
    /// or an approver approved the same change twice.
    #[error("Governance: {0}")]
    Governance(String),

    /// The operation deadline elapsed. Retry-eligible.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An embedding driver error occurred.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnchorError {
    /// Whether the caller may safely retry the operation.
    ///
    /// Lock misses, deadlines, and transient storage outages are retryable;
    /// validation and policy failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnchorError::Conflict(_)
                | AnchorError::DeadlineExceeded
                | AnchorError::StorageUnavailable(_)
        )
    }
}

/// Alias for Result with AnchorError.
pub type AnchorResult<T> = Result<T, AnchorError>;
