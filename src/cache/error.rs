//! Failure taxonomy of the cache engine.
//!
//! None of these reach the callers of [`super::CacheHandler`]: the handler logs
//! them and degrades to a miss, a dropped write or a no-op. A key with nothing
//! stored is not a failure and reads as `None`.

use thiserror::Error;

use super::backend::BackendError;
use super::codec::CodecError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage backend unavailable during {op}: {source}")]
    BackendUnavailable {
        op: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("malformed stored document `{name}`: {reason}")]
    Serialization { name: String, reason: String },
    #[error("storage backend rejected {op} due to write-rate limits")]
    RateLimited { op: &'static str },
    #[error("purge notification failed: {0}")]
    NotificationFailure(String),
}

impl CacheError {
    pub fn backend(op: &'static str, source: BackendError) -> Self {
        match source {
            BackendError::RateLimited => Self::RateLimited { op },
            source => Self::BackendUnavailable { op, source },
        }
    }

    pub fn serialization(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Serialization {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Short label used in log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::Serialization { .. } => "serialization",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotificationFailure(_) => "notification_failure",
        }
    }
}

impl From<CodecError> for CacheError {
    fn from(err: CodecError) -> Self {
        Self::Serialization {
            name: "payload".to_string(),
            reason: err.to_string(),
        }
    }
}
