//! # Errors
//!
//! Caller-facing error taxonomy plus the narrower store and codec errors that
//! feed into it.

use thiserror::Error;

/// Errors surfaced to whoever issued a request.
#[derive(Debug, Error)]
pub enum ContactError {
    /// The reference resolved to nothing.
    #[error("contact not found")]
    NotFound,
    /// An expected-version assertion failed. Recoverable by rebasing.
    #[error("version conflict: {0}")]
    VersionConflict(String),
    /// The caller supplied insufficient or inconsistent identifiers.
    #[error("bad arguments: {0}")]
    BadArguments(String),
    /// A batch failed irrecoverably.
    #[error("store conflict: {0}")]
    StoreConflict(String),
    /// The caller lacks write capability.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Error(#[from] anyhow::Error),
}

impl ContactError {
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::BadArguments(message.into())
    }

    pub fn store_conflict(message: impl Into<String>) -> Self {
        Self::StoreConflict(message.into())
    }

    /// Short stable name of the error kind, used in logs and outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            ContactError::NotFound => "not_found",
            ContactError::VersionConflict(_) => "version_conflict",
            ContactError::BadArguments(_) => "bad_arguments",
            ContactError::StoreConflict(_) => "store_conflict",
            ContactError::PermissionDenied(_) => "permission_denied",
            ContactError::Error(_) => "error",
        }
    }
}

pub type ContactResult<T> = std::result::Result<T, ContactError>;

/// Failures reported by a [`crate::store::ContactStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// An assert operation, or a version expectation, did not hold.
    #[error("assertion failed at operation {index}: {reason}")]
    AssertionFailed { index: usize, reason: String },
    /// The batch was malformed.
    #[error("invalid operation at {index}: {reason}")]
    InvalidOperation { index: usize, reason: String },
    /// The store could not be reached or refused the batch.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::AssertionFailed { .. })
    }
}

impl From<StoreError> for ContactError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AssertionFailed { .. } => ContactError::VersionConflict(err.to_string()),
            StoreError::InvalidOperation { .. } => ContactError::BadArguments(err.to_string()),
            StoreError::Unavailable(message) => ContactError::StoreConflict(message),
            StoreError::Storage(cause) => ContactError::Error(cause),
        }
    }
}

/// Row decoding and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("missing column {0}")]
    MissingColumn(&'static str),
    #[error("column {column} has unexpected type, expected {expected}")]
    WrongType {
        column: String,
        expected: &'static str,
    },
    #[error("columns not writable: {0:?}")]
    NotWritable(Vec<String>),
}

impl From<CodecError> for ContactError {
    fn from(err: CodecError) -> Self {
        ContactError::BadArguments(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let conflict: ContactError = StoreError::AssertionFailed {
            index: 0,
            reason: "version".to_string(),
        }
        .into();
        assert_eq!(conflict.kind(), "version_conflict");

        let unavailable: ContactError = StoreError::Unavailable("down".to_string()).into();
        assert!(matches!(unavailable, ContactError::StoreConflict(ref m) if m == "down"));

        let invalid: ContactError = StoreError::InvalidOperation {
            index: 2,
            reason: "no such row".to_string(),
        }
        .into();
        assert_eq!(invalid.kind(), "bad_arguments");
    }

    #[test]
    fn test_anyhow_becomes_generic_error() {
        let err: ContactError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), "error");
        assert_eq!(err.to_string(), "boom");
    }
}
