//! Caller-facing cache operations.
//!
//! [`CacheHandler`] wires the entry store, tag index, purge notifier and
//! generation guard together. Every operation first makes sure the generation
//! check ran, and none of them fail: errors are logged and the operation
//! degrades to a miss, a no-op or a zero count.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::backend::SharedBackend;
use super::config::CacheConfig;
use super::entry::{CacheEntry, EntrySummary, LookupHints, NewEntry};
use super::error::CacheError;
use super::generation::{GenerationGuard, GenerationOutcome};
use super::keys::EntryClass;
use super::notifier::{InvalidationNotifier, PurgeClient};
use super::store::EntryStore;
use super::tag_index::{TagIndex, TagsMapping};
use crate::util::clock::{Clock, SystemClock};

/// Snapshot of stored entries.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub entries: Vec<EntrySummary>,
}

#[derive(Clone)]
pub struct CacheHandler {
    inner: Arc<Inner>,
}

struct Inner {
    store: EntryStore,
    guard: GenerationGuard,
}

impl CacheHandler {
    pub fn builder(backend: SharedBackend) -> CacheHandlerBuilder {
        CacheHandlerBuilder {
            backend,
            clock: None,
            flush_interval: None,
            purge: None,
            guard: None,
        }
    }

    /// Open the configured backend and purge client.
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let backend = config.open_backend()?;
        let mut builder = Self::builder(backend).generation(config.generation_guard());
        if let Some(interval) = config.flush_interval {
            builder = builder.flush_interval(interval);
        }
        if let Some(client) = config.purge_client()? {
            builder = builder.purge_client(client);
        }
        Ok(builder.build())
    }

    fn store(&self) -> &EntryStore {
        &self.inner.store
    }

    fn index(&self) -> &TagIndex {
        self.inner.store.index()
    }

    pub fn notifier(&self) -> &InvalidationNotifier {
        self.inner.store.notifier()
    }

    async fn ensure_initialized(&self) -> &GenerationOutcome {
        self.inner.guard.ensure_checked(&self.inner.store).await
    }

    #[instrument(skip_all, fields(key = key, class = %class))]
    pub async fn get(&self, key: &str, class: EntryClass, hints: &LookupHints) -> Option<CacheEntry> {
        self.ensure_initialized().await;
        self.store().get(key, class, hints).await
    }

    #[instrument(skip_all, fields(key = key, class = %class))]
    pub async fn set(&self, key: &str, class: EntryClass, entry: NewEntry) -> bool {
        self.ensure_initialized().await;
        self.store().set(key, class, entry).await
    }

    #[instrument(skip_all, fields(key = key, class = %class))]
    pub async fn delete(&self, key: &str, class: EntryClass) -> bool {
        self.ensure_initialized().await;
        self.store().delete(key, class).await
    }

    /// Delete every entry of either class indexed under any of `tags`.
    ///
    /// The tags are also stamped as invalidated, which hides entries whose
    /// index updates are still queued elsewhere. Returns the number of
    /// entries deleted.
    #[instrument(skip_all, fields(tags = ?tags))]
    pub async fn revalidate_by_tag(&self, tags: &[String]) -> usize {
        self.ensure_initialized().await;
        let tags: Vec<String> = tags.iter().filter(|tag| !tag.is_empty()).cloned().collect();
        if tags.is_empty() {
            return 0;
        }

        self.index().mark_expired(&tags, self.store().now_ms());
        let keys = match self.index().keys_for_tags(&tags).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(op = "revalidate_by_tag", error = %err, kind = err.kind(), "Tag index unavailable");
                return 0;
            }
        };

        let mut deleted = 0;
        let mut deleted_keys = Vec::new();
        for key in &keys {
            let mut found = false;
            for class in EntryClass::ALL {
                match self.store().remove(class, key).await {
                    Ok(true) => {
                        deleted += 1;
                        found = true;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(op = "revalidate_by_tag", key = %key, %class, error = %err, "Entry delete failed");
                    }
                }
            }
            if found {
                deleted_keys.push(key.clone());
            }
        }

        self.index().delete_keys(keys.iter().cloned());
        self.notifier().tags_revalidated(&tags, &deleted_keys);
        info!(deleted, indexed = keys.len(), "Tags revalidated");
        deleted
    }

    /// Latest invalidation time across `tags` in unix milliseconds, `0` if none.
    pub async fn expiration_for_tags(&self, tags: &[String]) -> i64 {
        self.ensure_initialized().await;
        match self.index().expiration_for_tags(tags).await {
            Ok(at) => at,
            Err(err) => {
                warn!(op = "expiration_for_tags", error = %err, kind = err.kind(), "Tag expirations unavailable");
                0
            }
        }
    }

    /// Mark `tags` as invalidated now.
    #[instrument(skip_all, fields(tags = ?tags))]
    pub async fn update_tags(&self, tags: &[String]) {
        self.ensure_initialized().await;
        self.index().mark_expired(tags, self.store().now_ms());
    }

    pub async fn stats(&self) -> CacheStats {
        self.ensure_initialized().await;
        let mut entries = Vec::new();
        for class in EntryClass::ALL {
            match self.store().summaries(class).await {
                Ok(summaries) => entries.extend(summaries),
                Err(err) => {
                    warn!(op = "stats", %class, error = %err, kind = err.kind(), "Entry listing unavailable");
                }
            }
        }
        CacheStats {
            count: entries.len(),
            entries,
        }
    }

    /// Delete every entry of both classes except `preserve`, returning how
    /// many were deleted.
    ///
    /// Without preserved keys the tag index is reset; otherwise only the
    /// deleted keys are dropped from it so preserved entries stay reachable
    /// by tag.
    #[instrument(skip_all, fields(preserved = preserve.len()))]
    pub async fn clear_all(&self, preserve: &BTreeSet<String>) -> usize {
        self.ensure_initialized().await;
        if !preserve.is_empty() {
            // Queued adds would otherwise land after the deletes below.
            if let Err(err) = self.index().flush().await {
                warn!(op = "clear_all", error = %err, kind = err.kind(), "Tag index flush failed");
            }
        }
        let mut removed = Vec::new();
        for class in EntryClass::ALL {
            match self.store().clear_class(class, preserve).await {
                Ok(keys) => removed.extend(keys),
                Err(err) => {
                    warn!(op = "clear_all", %class, error = %err, kind = err.kind(), "Clear incomplete");
                }
            }
        }

        if preserve.is_empty() {
            self.index().clear();
        } else {
            self.index().delete_keys(removed.iter().cloned());
        }
        info!(cleared = removed.len(), "Cache cleared");
        removed.len()
    }

    /// Outcome of the one-time generation check, running it if needed.
    pub async fn check_generation(&self) -> GenerationOutcome {
        self.ensure_initialized().await.clone()
    }

    /// Authoritative tag mapping, flushing queued index writes first.
    pub async fn tags_mapping(&self) -> TagsMapping {
        match self.index().read_tags_mapping().await {
            Ok(mapping) => mapping,
            Err(err) => {
                warn!(op = "tags_mapping", error = %err, kind = err.kind(), "Tag index unavailable");
                TagsMapping::new()
            }
        }
    }

    /// Flush queued index writes and wait for outstanding purge calls.
    pub async fn shutdown(&self) {
        if let Err(err) = self.index().flush().await {
            warn!(op = "shutdown", error = %err, kind = err.kind(), "Tag index writes lost on shutdown");
        }
        self.notifier().settle().await;
    }
}

pub struct CacheHandlerBuilder {
    backend: SharedBackend,
    clock: Option<Arc<dyn Clock>>,
    flush_interval: Option<Duration>,
    purge: Option<PurgeClient>,
    guard: Option<GenerationGuard>,
}

impl CacheHandlerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn purge_client(mut self, client: PurgeClient) -> Self {
        self.purge = Some(client);
        self
    }

    pub fn generation(mut self, guard: GenerationGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn build(self) -> CacheHandler {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let index = match self.flush_interval {
            Some(interval) => TagIndex::with_interval(self.backend.clone(), interval),
            None => TagIndex::new(self.backend.clone()),
        };
        let notifier = InvalidationNotifier::new(self.purge);
        let store = EntryStore::new(self.backend, clock, index, notifier);

        CacheHandler {
            inner: Arc::new(Inner {
                store,
                guard: self.guard.unwrap_or_else(GenerationGuard::disabled),
            }),
        }
    }
}
