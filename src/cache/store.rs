//! Entry storage.
//!
//! Reads enforce expiry and tag invalidation, writes feed the tag index and
//! the purge notifier. The public operations never return errors: a backend
//! or decoding failure is logged and turned into a miss or a dropped write so
//! the surrounding request keeps working.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use super::backend::SharedBackend;
use super::codec::{decode, encode};
use super::entry::{
    CacheEntry, EntrySummary, EntryTiming, LookupHints, NewEntry, StoredEntry, check_freshness,
};
use super::error::CacheError;
use super::keys::{EntryClass, entry_name, entry_path, entry_path_for_name, sanitize_key};
use super::notifier::InvalidationNotifier;
use super::request_tags;
use super::tag_index::TagIndex;
use crate::util::clock::Clock;

const METRIC_HIT_TOTAL: &str = "tagstash_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "tagstash_cache_miss_total";
const METRIC_STALE_DROP_TOTAL: &str = "tagstash_cache_stale_drop_total";

#[derive(Clone)]
pub struct EntryStore {
    backend: SharedBackend,
    clock: Arc<dyn Clock>,
    index: TagIndex,
    notifier: InvalidationNotifier,
}

impl EntryStore {
    pub fn new(
        backend: SharedBackend,
        clock: Arc<dyn Clock>,
        index: TagIndex,
        notifier: InvalidationNotifier,
    ) -> Self {
        Self {
            backend,
            clock,
            index,
            notifier,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    pub fn notifier(&self) -> &InvalidationNotifier {
        &self.notifier
    }

    /// Look up a live entry.
    ///
    /// Expired, revalidation-due and tag-invalidated entries read as absent
    /// and are deleted on the way. Tags of a hit are reported to the active
    /// request scope.
    pub async fn get(&self, key: &str, class: EntryClass, hints: &LookupHints) -> Option<CacheEntry> {
        let stored = match self.read(class, key).await {
            Ok(Some((stored, _))) => stored,
            Ok(None) => {
                counter!(METRIC_MISS_TOTAL, "class" => class.as_str()).increment(1);
                return None;
            }
            Err(err) => {
                counter!(METRIC_MISS_TOTAL, "class" => class.as_str()).increment(1);
                warn!(key, %class, error = %err, kind = err.kind(), "Cache read degraded to miss");
                if matches!(err, CacheError::Serialization { .. }) {
                    self.discard(class, key).await;
                }
                return None;
            }
        };

        let now = self.clock.now_ms();
        let invalidated_at = self.tag_invalidation(&stored, hints).await;
        if let Err(rejection) = check_freshness(class, &stored.timing, invalidated_at, now) {
            counter!(
                METRIC_STALE_DROP_TOTAL,
                "class" => class.as_str(),
                "reason" => rejection.as_str()
            )
            .increment(1);
            debug!(key, %class, reason = rejection.as_str(), "Dropping entry that is no longer fresh");
            self.discard(class, key).await;
            return None;
        }

        let payload = match decode(stored.payload) {
            Ok(payload) => payload,
            Err(err) => {
                counter!(METRIC_MISS_TOTAL, "class" => class.as_str()).increment(1);
                warn!(key, %class, error = %err, "Stored payload could not be decoded");
                self.discard(class, key).await;
                return None;
            }
        };

        counter!(METRIC_HIT_TOTAL, "class" => class.as_str()).increment(1);
        if !stored.tags.is_empty() {
            request_tags::add_tags(stored.tags.iter().cloned());
        }

        Some(CacheEntry {
            key: stored.key,
            class,
            payload,
            tags: stored.tags,
            timing: stored.timing,
        })
    }

    /// Persist an entry. Returns whether it was written.
    ///
    /// The tag index is updated asynchronously through its write queue; tags
    /// the key no longer carries are dropped from it.
    pub async fn set(&self, key: &str, class: EntryClass, entry: NewEntry) -> bool {
        match self.write(class, key, entry).await {
            Ok(stored) => {
                self.reindex(class, key, stored.tags).await;
                if class == EntryClass::Durable {
                    self.notifier.entry_updated(key);
                }
                true
            }
            Err(err) => {
                warn!(key, %class, error = %err, kind = err.kind(), "Cache write dropped");
                false
            }
        }
    }

    /// Remove an entry, reporting whether it existed.
    pub async fn delete(&self, key: &str, class: EntryClass) -> bool {
        match self.remove(class, key).await {
            Ok(found) => {
                if found {
                    self.reindex(class, key, BTreeSet::new()).await;
                }
                found
            }
            Err(err) => {
                warn!(key, %class, error = %err, kind = err.kind(), "Cache delete failed");
                false
            }
        }
    }

    /// Read and parse the stored document for `key`, with its encoded size.
    pub async fn read(
        &self,
        class: EntryClass,
        key: &str,
    ) -> Result<Option<(StoredEntry, usize)>, CacheError> {
        let path = entry_path(class, key);
        let Some(raw) = self
            .backend
            .get(&path)
            .await
            .map_err(|err| CacheError::backend("entry_read", err))?
        else {
            return Ok(None);
        };
        let stored = parse(&path, &raw)?;
        // Names are digests for unusual keys; guard against a foreign document.
        if stored.key != key {
            return Ok(None);
        }
        Ok(Some((stored, raw.len())))
    }

    pub async fn write(
        &self,
        class: EntryClass,
        key: &str,
        entry: NewEntry,
    ) -> Result<StoredEntry, CacheError> {
        let timing = EntryTiming::new(self.clock.now_ms(), &entry);
        let tags: BTreeSet<String> = entry
            .tags
            .into_iter()
            .filter(|tag| !tag.is_empty())
            .collect();
        let payload = encode(entry.payload).await?;
        let stored = StoredEntry {
            key: key.to_string(),
            class,
            tags,
            timing,
            payload,
        };

        let path = entry_path(class, key);
        let raw = serde_json::to_vec(&stored).map_err(|err| CacheError::serialization(&path, err))?;
        self.backend
            .put(&path, Bytes::from(raw))
            .await
            .map_err(|err| CacheError::backend("entry_write", err))?;
        Ok(stored)
    }

    pub async fn remove(&self, class: EntryClass, key: &str) -> Result<bool, CacheError> {
        self.backend
            .delete(&entry_path(class, key))
            .await
            .map_err(|err| CacheError::backend("entry_delete", err))
    }

    /// Metadata of every readable entry of `class`.
    pub async fn summaries(&self, class: EntryClass) -> Result<Vec<EntrySummary>, CacheError> {
        let paths = self.list(class).await?;
        let mut summaries = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = match self.backend.get(&path).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => return Err(CacheError::backend("entry_read", err)),
            };
            match parse(&path, &raw) {
                Ok(stored) => summaries.push(EntrySummary::from_stored(&stored)),
                Err(err) => warn!(path, error = %err, "Skipping unreadable entry"),
            }
        }
        Ok(summaries)
    }

    /// Delete every entry of `class` whose key is not in `preserve`.
    ///
    /// Returns the original keys of the removed entries; unreadable documents
    /// are removed too and reported by storage name.
    pub async fn clear_class(
        &self,
        class: EntryClass,
        preserve: &BTreeSet<String>,
    ) -> Result<Vec<String>, CacheError> {
        let preserved: BTreeSet<String> = preserve.iter().map(|key| sanitize_key(key)).collect();
        let mut removed = Vec::new();
        for path in self.list(class).await? {
            let Some(name) = entry_name(class, &path) else {
                continue;
            };
            if preserved.contains(name) {
                continue;
            }

            let key = match self.backend.get(&path).await {
                Ok(Some(raw)) => parse(&path, &raw)
                    .map(|stored| stored.key)
                    .unwrap_or_else(|_| name.to_string()),
                Ok(None) => continue,
                Err(err) => return Err(CacheError::backend("entry_read", err)),
            };
            let deleted = self
                .backend
                .delete(&entry_path_for_name(class, name))
                .await
                .map_err(|err| CacheError::backend("entry_delete", err))?;
            if deleted {
                removed.push(key);
            }
        }
        debug!(%class, removed = removed.len(), "Cleared entry class");
        Ok(removed)
    }

    async fn list(&self, class: EntryClass) -> Result<Vec<String>, CacheError> {
        self.backend
            .list(class.prefix())
            .await
            .map_err(|err| CacheError::backend("entry_list", err))
    }

    async fn tag_invalidation(&self, stored: &StoredEntry, hints: &LookupHints) -> i64 {
        let tags: Vec<&str> = stored
            .tags
            .iter()
            .map(String::as_str)
            .chain(hints.soft_tags.iter().map(String::as_str))
            .collect();
        match self.index.expiration_for_tags(&tags).await {
            Ok(at) => at,
            Err(err) => {
                warn!(key = %stored.key, error = %err, "Tag expirations unavailable, skipping check");
                0
            }
        }
    }

    /// Best-effort removal of an entry that must not be served.
    async fn discard(&self, class: EntryClass, key: &str) {
        match self.remove(class, key).await {
            Ok(true) => self.reindex(class, key, BTreeSet::new()).await,
            Ok(false) => {}
            Err(err) => debug!(key, %class, error = %err, "Could not remove rejected entry"),
        }
    }

    /// Index `key` under `tags` plus the tags of its entry in the other class.
    ///
    /// If the other class cannot be read, existing index tags are kept and
    /// `tags` are only added.
    async fn reindex(&self, class: EntryClass, key: &str, tags: BTreeSet<String>) {
        let other = match self.read(class.other(), key).await {
            Ok(found) => found.map(|(stored, _)| stored.tags).unwrap_or_default(),
            Err(err) => {
                debug!(key, %class, error = %err, "Keeping index tags of unreadable sibling entry");
                let tags: Vec<String> = tags.into_iter().collect();
                self.index.add_tags(key, &tags);
                return;
            }
        };
        let tags: Vec<String> = tags.union(&other).cloned().collect();
        self.index.replace_tags(key, &tags);
    }
}

fn parse(path: &str, raw: &[u8]) -> Result<StoredEntry, CacheError> {
    serde_json::from_slice(raw).map_err(|err| CacheError::serialization(path, err))
}
