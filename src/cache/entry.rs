//! Cache entry model and its stored document form.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::codec::{Payload, StoredPayload};
use super::keys::EntryClass;
use crate::util::clock::duration_ms;

/// Data supplied by a producer when writing an entry.
#[derive(Debug)]
pub struct NewEntry {
    pub payload: Payload,
    pub tags: Vec<String>,
    /// Age after which readers should refresh in the background.
    pub stale_after: Option<Duration>,
    /// Age after which an ephemeral entry is treated as absent.
    pub revalidate_after: Option<Duration>,
    /// Age after which the entry is absent regardless of class.
    pub expire_after: Option<Duration>,
}

impl NewEntry {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            tags: Vec::new(),
            stale_after: None,
            revalidate_after: None,
            expire_after: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    pub fn revalidate_after(mut self, age: Duration) -> Self {
        self.revalidate_after = Some(age);
        self
    }

    pub fn expire_after(mut self, age: Duration) -> Self {
        self.expire_after = Some(age);
        self
    }
}

/// A live entry returned by a read.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub class: EntryClass,
    pub payload: Payload,
    pub tags: BTreeSet<String>,
    pub timing: EntryTiming,
}

impl CacheEntry {
    /// Whether `stale_after` has elapsed; stale entries are still served.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        self.timing.is_stale(now_ms)
    }
}

/// Creation time and relative limits, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTiming {
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidate_after_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_ms: Option<i64>,
}

impl EntryTiming {
    pub fn new(created_at: i64, entry: &NewEntry) -> Self {
        Self {
            created_at,
            stale_after_ms: entry.stale_after.map(duration_ms),
            revalidate_after_ms: entry.revalidate_after.map(duration_ms),
            expire_after_ms: entry.expire_after.map(duration_ms),
        }
    }

    pub fn age(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.created_at)
    }

    pub fn is_stale(&self, now_ms: i64) -> bool {
        self.stale_after_ms
            .is_some_and(|limit| self.age(now_ms) > limit)
    }

    pub fn needs_revalidation(&self, now_ms: i64) -> bool {
        self.revalidate_after_ms
            .is_some_and(|limit| self.age(now_ms) > limit)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_after_ms
            .is_some_and(|limit| self.age(now_ms) > limit)
    }

    /// Absolute instant for a relative limit.
    pub fn deadline(&self, limit_ms: Option<i64>) -> Option<i64> {
        limit_ms.map(|limit| self.created_at.saturating_add(limit))
    }
}

/// Why a stored entry is not served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Expired,
    NeedsRevalidation,
    TagInvalidated,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::NeedsRevalidation => "revalidate",
            Self::TagInvalidated => "tag_invalidated",
        }
    }
}

/// Decide whether an entry may be served.
///
/// `tag_invalidated_at` is the latest invalidation across the entry's tags and
/// the caller's soft tags. Age-based revalidation applies to ephemeral entries
/// only; durable entries are replaced by their producer, not aged out.
pub fn check_freshness(
    class: EntryClass,
    timing: &EntryTiming,
    tag_invalidated_at: i64,
    now_ms: i64,
) -> Result<(), Rejection> {
    if timing.is_expired(now_ms) {
        return Err(Rejection::Expired);
    }
    if class == EntryClass::Ephemeral && timing.needs_revalidation(now_ms) {
        return Err(Rejection::NeedsRevalidation);
    }
    if tag_invalidated_at > timing.created_at {
        return Err(Rejection::TagInvalidated);
    }
    Ok(())
}

/// Caller-supplied context for a read.
#[derive(Debug, Clone, Default)]
pub struct LookupHints {
    /// Implicit tags whose invalidation also hides the entry. They are neither
    /// indexed nor reported to the request tag accumulator.
    pub soft_tags: Vec<String>,
}

impl LookupHints {
    pub fn with_soft_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            soft_tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// The JSON document persisted per entry: metadata plus encoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    pub class: EntryClass,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(flatten)]
    pub timing: EntryTiming,
    pub payload: StoredPayload,
}

/// Metadata-only view of a stored entry, used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub key: String,
    pub class: EntryClass,
    pub tags: BTreeSet<String>,
    pub size_bytes: usize,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revalidate_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<i64>,
}

impl EntrySummary {
    pub fn from_stored(stored: &StoredEntry) -> Self {
        let timing = &stored.timing;
        Self {
            key: stored.key.clone(),
            class: stored.class,
            tags: stored.tags.clone(),
            size_bytes: stored.payload.decoded_len(),
            created_at: timing.created_at,
            stale_at: timing.deadline(timing.stale_after_ms),
            revalidate_at: timing.deadline(timing.revalidate_after_ms),
            expire_at: timing.deadline(timing.expire_after_ms),
        }
    }
}
