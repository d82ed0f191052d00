//! In-process backend.
//!
//! Keeps documents in a map and records every write, which makes it the
//! backend of choice for embedding in tests. Write failures can be injected
//! to exercise the coalescer's retry path.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BackendError, StorageBackend, validate_name};
use crate::cache::lock::{mutex_lock, read_lock, write_lock};

const SOURCE: &str = "cache::backend::memory";
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub struct MemoryBackend {
    documents: RwLock<BTreeMap<String, Bytes>>,
    writes: Mutex<Vec<(String, Bytes)>>,
    failing_puts: AtomicUsize,
    flush_interval: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_flush_interval(DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_flush_interval(flush_interval: Duration) -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            failing_puts: AtomicUsize::new(0),
            flush_interval,
        }
    }

    /// Reject the next `count` writes with [`BackendError::RateLimited`].
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Every successful write of `name`, oldest first.
    pub fn writes_of(&self, name: &str) -> Vec<Bytes> {
        mutex_lock(&self.writes, SOURCE, "writes_of")
            .iter()
            .filter(|(written, _)| written == name)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        read_lock(&self.documents, SOURCE, "contains").contains_key(name)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.documents, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>, BackendError> {
        validate_name(name)?;
        Ok(read_lock(&self.documents, SOURCE, "get").get(name).cloned())
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<(), BackendError> {
        validate_name(name)?;
        let rejected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BackendError::RateLimited);
        }

        write_lock(&self.documents, SOURCE, "put").insert(name.to_string(), data.clone());
        mutex_lock(&self.writes, SOURCE, "put.log").push((name.to_string(), data));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, BackendError> {
        validate_name(name)?;
        Ok(write_lock(&self.documents, SOURCE, "delete")
            .remove(name)
            .is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        Ok(read_lock(&self.documents, SOURCE, "list")
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}
