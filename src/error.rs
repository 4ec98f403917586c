use std::sync::PoisonError;
use thiserror::Error;

use crate::tag::TagKind;

/// A specialized `Result` type for tracing operations.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the tracing API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// The requested tag is not present on the span.
    #[error("tag `{key}` not found")]
    NotFound {
        /// Key that was looked up.
        key: String,
    },

    /// The tag exists but holds a value of a different type than requested.
    #[error("tag `{key}` holds a {actual} value, requested {requested}")]
    TypeMismatch {
        /// Key that was looked up.
        key: String,
        /// Type the caller asked for.
        requested: TagKind,
        /// Type actually stored under the key.
        actual: TagKind,
    },

    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A pluggable backend hook failed. Recorded and swallowed by the
    /// dispatch path, never propagated into an operation.
    #[error("backend failure: {0}")]
    BackendFailure(String),
}

impl From<String> for TraceError {
    fn from(err_msg: String) -> Self {
        TraceError::BackendFailure(err_msg)
    }
}

impl<T> From<PoisonError<T>> for TraceError {
    fn from(err: PoisonError<T>) -> Self {
        TraceError::BackendFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_key() {
        let err = TraceError::NotFound {
            key: "db.statement".into(),
        };
        assert_eq!(err.to_string(), "tag `db.statement` not found");

        let err = TraceError::TypeMismatch {
            key: "net.host.port".into(),
            requested: TagKind::Str,
            actual: TagKind::U64,
        };
        assert_eq!(
            err.to_string(),
            "tag `net.host.port` holds a u64 value, requested string"
        );
    }
}
