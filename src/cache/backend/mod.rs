//! Storage backends.
//!
//! Every layer above this module talks to storage through [`StorageBackend`]:
//! whole-document get/put/delete plus listing by prefix. Document names are the
//! slash-separated paths produced by [`super::keys`].

mod disk;
mod memory;
mod object;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;
pub use object::ObjectStoreBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from object store")]
    Status { status: u16 },
    #[error("write rate limit exceeded")]
    RateLimited,
    #[error("invalid document name `{0}`")]
    InvalidName(String),
}

/// Uniform document storage contract.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Minimum spacing between writes of one shared document.
    fn flush_interval(&self) -> Duration;

    async fn get(&self, name: &str) -> Result<Option<Bytes>, BackendError>;

    async fn put(&self, name: &str, data: Bytes) -> Result<(), BackendError>;

    /// Remove a document, reporting whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, BackendError>;

    /// Names of every document starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;
}

pub type SharedBackend = Arc<dyn StorageBackend>;

/// Reject names that could escape the backend namespace.
pub(crate) fn validate_name(name: &str) -> Result<(), BackendError> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(BackendError::InvalidName(name.to_string()));
    }
    Ok(())
}
