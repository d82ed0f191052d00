//! Tag index with a write-coalescing buffer.
//!
//! The tag→keys mapping and the tag expiration timestamps are two shared
//! documents per backend. Writers never touch them directly: mutations are
//! queued in memory and merged into a single write per flush, spaced at least
//! one backend flush interval apart.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::SharedBackend;
use super::error::CacheError;
use super::keys::{TAG_EXPIRATIONS_DOCUMENT, TAGS_DOCUMENT};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::tag_index";

const METRIC_FLUSH_TOTAL: &str = "tagstash_tag_index_flush_total";
const METRIC_FLUSH_MS: &str = "tagstash_tag_index_flush_ms";
const METRIC_PENDING: &str = "tagstash_tag_index_pending";

/// Persisted `tag -> keys` mapping.
pub type TagsMapping = BTreeMap<String, BTreeSet<String>>;

/// Persisted `tag -> invalidated_at` timestamps in unix milliseconds.
pub type TagExpirations = BTreeMap<String, i64>;

/// A queued change awaiting the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMutation {
    Add { key: String, tags: Vec<String> },
    Delete { key: String },
    Expire { tags: Vec<String>, at: i64 },
    /// Drop the whole mapping. Only add/delete mutations queued after it apply.
    Reset,
}

impl IndexMutation {
    fn touches_mapping(&self) -> bool {
        !matches!(self, Self::Expire { .. })
    }
}

/// Durable tag index fronted by an in-memory mutation queue.
///
/// Cloning is cheap and every clone shares the same queue.
#[derive(Clone)]
pub struct TagIndex {
    inner: Arc<Inner>,
}

struct Inner {
    backend: SharedBackend,
    interval: Duration,
    queue: Mutex<Vec<IndexMutation>>,
    /// Serialises flushes so only one write to the shared documents is in flight.
    flush_lock: tokio::sync::Mutex<()>,
    scheduled: AtomicBool,
    /// Earliest instant the next write may start.
    next_slot: Mutex<Option<Instant>>,
    expirations: Mutex<ExpirationState>,
}

#[derive(Default)]
struct ExpirationState {
    refreshed_at: Option<Instant>,
    map: TagExpirations,
}

impl TagIndex {
    pub fn new(backend: SharedBackend) -> Self {
        let interval = backend.flush_interval();
        Self::with_interval(backend, interval)
    }

    pub fn with_interval(backend: SharedBackend, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                interval,
                queue: Mutex::new(Vec::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                scheduled: AtomicBool::new(false),
                next_slot: Mutex::new(None),
                expirations: Mutex::new(ExpirationState::default()),
            }),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.inner.interval
    }

    /// Queue `key` to be listed under each of `tags`.
    pub fn add_tags(&self, key: &str, tags: &[String]) {
        let tags: Vec<String> = tags
            .iter()
            .filter(|tag| !tag.is_empty())
            .cloned()
            .collect();
        if tags.is_empty() {
            return;
        }
        self.enqueue(IndexMutation::Add {
            key: key.to_string(),
            tags,
        });
    }

    /// Queue `key` to be listed under exactly `tags`, dropping any tag it
    /// carried before.
    pub fn replace_tags(&self, key: &str, tags: &[String]) {
        let tags: Vec<String> = tags
            .iter()
            .filter(|tag| !tag.is_empty())
            .cloned()
            .collect();
        let mut mutations = vec![IndexMutation::Delete {
            key: key.to_string(),
        }];
        if !tags.is_empty() {
            mutations.push(IndexMutation::Add {
                key: key.to_string(),
                tags,
            });
        }
        self.enqueue_all(mutations);
    }

    /// Queue removal of `key` from every tag.
    pub fn delete_key(&self, key: &str) {
        self.enqueue(IndexMutation::Delete {
            key: key.to_string(),
        });
    }

    pub fn delete_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mutations: Vec<_> = keys
            .into_iter()
            .map(|key| IndexMutation::Delete { key: key.into() })
            .collect();
        if mutations.is_empty() {
            return;
        }
        self.enqueue_all(mutations);
    }

    /// Record that `tags` were invalidated at `at`.
    ///
    /// Visible to [`Self::expiration_for_tags`] immediately; persisted with the
    /// next flush.
    pub fn mark_expired(&self, tags: &[String], at: i64) {
        let tags: Vec<String> = tags
            .iter()
            .filter(|tag| !tag.is_empty())
            .cloned()
            .collect();
        if tags.is_empty() {
            return;
        }
        {
            let mut state = mutex_lock(&self.inner.expirations, SOURCE, "mark_expired");
            for tag in &tags {
                merge_expiration(&mut state.map, tag, at);
            }
        }
        self.enqueue(IndexMutation::Expire { tags, at });
    }

    /// Queue an empty mapping, discarding pending adds and deletes.
    pub fn clear(&self) {
        {
            let mut queue = mutex_lock(&self.inner.queue, SOURCE, "clear");
            queue.retain(|mutation| !mutation.touches_mapping());
            queue.push(IndexMutation::Reset);
            gauge!(METRIC_PENDING).set(queue.len() as f64);
        }
        self.schedule(self.inner.interval);
    }

    pub fn pending(&self) -> usize {
        mutex_lock(&self.inner.queue, SOURCE, "pending").len()
    }

    /// Authoritative mapping, after flushing everything queued so far.
    pub async fn read_tags_mapping(&self) -> Result<TagsMapping, CacheError> {
        self.flush().await?;
        self.load_mapping().await
    }

    /// Union of the keys indexed under any of `tags`.
    pub async fn keys_for_tags(&self, tags: &[String]) -> Result<BTreeSet<String>, CacheError> {
        let mapping = self.read_tags_mapping().await?;
        Ok(tags
            .iter()
            .filter_map(|tag| mapping.get(tag))
            .flatten()
            .cloned()
            .collect())
    }

    /// Latest invalidation across `tags`, `0` if none were ever invalidated.
    ///
    /// Stamps written by other processes sharing the backend become visible
    /// within one flush interval.
    pub async fn expiration_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> Result<i64, CacheError> {
        if tags.is_empty() {
            return Ok(0);
        }
        self.refresh_expirations_if_stale().await?;
        let state = mutex_lock(&self.inner.expirations, SOURCE, "expiration_for_tags");
        Ok(tags
            .iter()
            .filter_map(|tag| state.map.get(tag.as_ref()))
            .copied()
            .max()
            .unwrap_or(0))
    }

    /// Write every queued mutation.
    ///
    /// Callers arriving while a flush is in flight wait for it, then flush
    /// whatever was queued meanwhile. Only a non-empty queue waits for the
    /// next write slot. On failure the batch is put back in front of the queue
    /// and the next attempt is held back by twice the flush interval.
    pub async fn flush(&self) -> Result<(), CacheError> {
        loop {
            let _guard = self.inner.flush_lock.lock().await;
            let idle = mutex_lock(&self.inner.queue, SOURCE, "flush.peek").is_empty();
            if idle {
                gauge!(METRIC_PENDING).set(0.0);
                return Ok(());
            }
            self.wait_for_slot().await;

            let batch = {
                let mut queue = mutex_lock(&self.inner.queue, SOURCE, "flush.take");
                std::mem::take(&mut *queue)
            };
            if batch.is_empty() {
                gauge!(METRIC_PENDING).set(0.0);
                return Ok(());
            }

            let started_at = Instant::now();
            let result = self.write_batch(&batch).await;
            let spacing = match result {
                Ok(()) => self.inner.interval,
                Err(_) => self.inner.interval * 2,
            };
            *mutex_lock(&self.inner.next_slot, SOURCE, "flush.mark") = Some(Instant::now() + spacing);
            histogram!(METRIC_FLUSH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

            match result {
                Ok(()) => {
                    counter!(METRIC_FLUSH_TOTAL, "result" => "ok").increment(1);
                    debug!(mutations = batch.len(), "Tag index flushed");
                }
                Err(err) => {
                    counter!(METRIC_FLUSH_TOTAL, "result" => "error").increment(1);
                    let requeued = batch.len();
                    {
                        let mut queue = mutex_lock(&self.inner.queue, SOURCE, "flush.requeue");
                        let newer = std::mem::replace(&mut *queue, batch);
                        drop_superseded_adds(&mut queue, &newer);
                        queue.extend(newer);
                        gauge!(METRIC_PENDING).set(queue.len() as f64);
                    }
                    warn!(
                        error = %err,
                        kind = err.kind(),
                        requeued,
                        "Tag index flush failed, retrying with backoff"
                    );
                    self.schedule(self.inner.interval * 2);
                    return Err(err);
                }
            }
        }
    }

    fn enqueue(&self, mutation: IndexMutation) {
        self.enqueue_all(vec![mutation]);
    }

    /// Append `mutations`. A delete supersedes adds of the same key queued
    /// before it.
    fn enqueue_all(&self, mutations: Vec<IndexMutation>) {
        {
            let mut queue = mutex_lock(&self.inner.queue, SOURCE, "enqueue");
            drop_superseded_adds(&mut queue, &mutations);
            queue.extend(mutations);
            gauge!(METRIC_PENDING).set(queue.len() as f64);
        }
        self.schedule(self.inner.interval);
    }

    /// Spawn a delayed background flush unless one is already pending.
    ///
    /// A pending flush that wakes early still waits for the next write slot.
    fn schedule(&self, delay: Duration) {
        if self.inner.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            self.inner.scheduled.store(false, Ordering::SeqCst);
            debug!("No async runtime, tag index waits for an explicit flush");
            return;
        };

        let index = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            index.inner.scheduled.store(false, Ordering::SeqCst);
            // Failures are logged and rescheduled inside flush.
            let _ = index.flush().await;
        });
    }

    async fn wait_for_slot(&self) {
        let slot = *mutex_lock(&self.inner.next_slot, SOURCE, "wait_for_slot");
        if let Some(slot) = slot {
            tokio::time::sleep_until(slot).await;
        }
    }

    async fn write_batch(&self, batch: &[IndexMutation]) -> Result<(), CacheError> {
        if batch.iter().any(IndexMutation::touches_mapping) {
            let reset_at = batch
                .iter()
                .rposition(|mutation| *mutation == IndexMutation::Reset);
            let (mut mapping, pending) = match reset_at {
                Some(position) => (TagsMapping::new(), &batch[position + 1..]),
                None => (self.load_mapping().await?, batch),
            };
            apply_mutations(&mut mapping, pending);
            self.store_document(TAGS_DOCUMENT, &mapping).await?;
            if reset_at.is_some() {
                info!(tags = mapping.len(), "Tag index reset");
            }
        }

        let expired: Vec<(&Vec<String>, i64)> = batch
            .iter()
            .filter_map(|mutation| match mutation {
                IndexMutation::Expire { tags, at } => Some((tags, *at)),
                _ => None,
            })
            .collect();
        // Every flush merges stamps written by other processes.
        let mut stored: TagExpirations = self.load_document(TAG_EXPIRATIONS_DOCUMENT).await?;
        if !expired.is_empty() {
            for (tags, at) in expired {
                for tag in tags {
                    merge_expiration(&mut stored, tag, at);
                }
            }
            self.store_document(TAG_EXPIRATIONS_DOCUMENT, &stored).await?;
        }
        self.merge_expirations(stored);
        Ok(())
    }

    async fn refresh_expirations_if_stale(&self) -> Result<(), CacheError> {
        let refreshed_at = mutex_lock(&self.inner.expirations, SOURCE, "refresh.check").refreshed_at;
        if refreshed_at.is_some_and(|at| at.elapsed() < self.inner.interval) {
            return Ok(());
        }
        let stored: TagExpirations = self.load_document(TAG_EXPIRATIONS_DOCUMENT).await?;
        self.merge_expirations(stored);
        Ok(())
    }

    fn merge_expirations(&self, stored: TagExpirations) {
        let mut state = mutex_lock(&self.inner.expirations, SOURCE, "merge_expirations");
        for (tag, at) in stored {
            merge_expiration(&mut state.map, &tag, at);
        }
        state.refreshed_at = Some(Instant::now());
    }

    async fn load_mapping(&self) -> Result<TagsMapping, CacheError> {
        self.load_document(TAGS_DOCUMENT).await
    }

    async fn load_document<T>(&self, name: &str) -> Result<T, CacheError>
    where
        T: DeserializeOwned + Default,
    {
        let raw = self
            .inner
            .backend
            .get(name)
            .await
            .map_err(|err| CacheError::backend("index_read", err))?;
        match raw {
            Some(raw) => {
                serde_json::from_slice(&raw).map_err(|err| CacheError::serialization(name, err))
            }
            None => Ok(T::default()),
        }
    }

    async fn store_document<T: Serialize>(&self, name: &str, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(value).map_err(|err| CacheError::serialization(name, err))?;
        self.inner
            .backend
            .put(name, Bytes::from(raw))
            .await
            .map_err(|err| CacheError::backend("index_write", err))
    }
}

fn deleted_keys(mutations: &[IndexMutation]) -> BTreeSet<&str> {
    mutations
        .iter()
        .filter_map(|mutation| match mutation {
            IndexMutation::Delete { key } => Some(key.as_str()),
            _ => None,
        })
        .collect()
}

/// Remove adds from `queue` whose key is deleted by `later`.
fn drop_superseded_adds(queue: &mut Vec<IndexMutation>, later: &[IndexMutation]) {
    let deleted = deleted_keys(later);
    if deleted.is_empty() {
        return;
    }
    queue.retain(|queued| {
        !matches!(queued, IndexMutation::Add { key, .. } if deleted.contains(key.as_str()))
    });
}

/// Apply deletes first, then adds, pruning tags left without keys.
fn apply_mutations(mapping: &mut TagsMapping, batch: &[IndexMutation]) {
    let deleted = deleted_keys(batch);
    if !deleted.is_empty() {
        mapping.retain(|_, keys| {
            keys.retain(|key| !deleted.contains(key.as_str()));
            !keys.is_empty()
        });
    }

    for mutation in batch {
        if let IndexMutation::Add { key, tags } = mutation {
            for tag in tags {
                mapping.entry(tag.clone()).or_default().insert(key.clone());
            }
        }
    }
}

fn merge_expiration(map: &mut TagExpirations, tag: &str, at: i64) {
    let current = map.entry(tag.to_string()).or_insert(at);
    *current = (*current).max(at);
}
