//! Request-scoped tag accumulator.
//!
//! Uses `tokio::task_local!` so every cache read that runs inside the future
//! given to [`run`] records its tags into that request's set, and only that
//! request's set. Concurrent requests each get their own scope.
//!
//! Task-locals do not follow `tokio::spawn`: work dispatched to another task
//! must be wrapped with [`propagate`] at the spawn site, otherwise its tags are
//! dropped. [`TagLedger`] covers code paths that cannot be reached through the
//! scope at all by keying tags on an explicit correlation id.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::request_tags";

tokio::task_local! {
    static REQUEST_TAGS: TagSet;
}

#[derive(Debug, Clone, Default)]
struct TagSet(Arc<Mutex<BTreeSet<String>>>);

impl TagSet {
    fn snapshot(&self) -> BTreeSet<String> {
        mutex_lock(&self.0, SOURCE, "snapshot").clone()
    }
}

/// Run `f` with a fresh, empty tag set.
///
/// Returns the output of `f` together with every tag recorded while it ran.
pub async fn run<F>(f: F) -> (F::Output, BTreeSet<String>)
where
    F: Future,
{
    let set = TagSet::default();
    let output = REQUEST_TAGS.scope(set.clone(), f).await;
    (output, set.snapshot())
}

/// Record tags into the active request's set.
///
/// Outside of [`run`] (build-time rendering, background jobs) the tags are
/// silently discarded.
pub fn add_tags<I, S>(tags: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let recorded = REQUEST_TAGS.try_with(|set| {
        let mut guard = mutex_lock(&set.0, SOURCE, "add_tags");
        guard.extend(tags.into_iter().map(Into::into));
    });
    if recorded.is_err() {
        trace!("No active request scope, tags discarded");
    }
}

/// Tags recorded so far in the active request, deduplicated.
pub fn tags() -> BTreeSet<String> {
    REQUEST_TAGS
        .try_with(TagSet::snapshot)
        .unwrap_or_default()
}

/// Whether the current task runs inside [`run`].
pub fn is_active() -> bool {
    REQUEST_TAGS.try_with(|_| ()).is_ok()
}

/// Carry the caller's tag set into `f`, typically right before `tokio::spawn`.
///
/// The set is captured when `propagate` is called, not when `f` is first
/// polled, so the returned future may run on any task.
pub fn propagate<F>(f: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let captured = REQUEST_TAGS.try_with(TagSet::clone).ok();
    async move {
        match captured {
            Some(set) => REQUEST_TAGS.scope(set, f).await,
            None => f.await,
        }
    }
}

/// Tags keyed by an explicit correlation id, with expiry.
///
/// For integrations whose read path cannot run inside [`run`]. Ids that are
/// never finished are dropped once `ttl` passes without activity.
#[derive(Debug)]
pub struct TagLedger {
    entries: DashMap<Uuid, LedgerEntry>,
    ttl: Duration,
}

#[derive(Debug)]
struct LedgerEntry {
    tags: BTreeSet<String>,
    touched: Instant,
}

impl TagLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Open a new correlation id. Expired ids are swept first.
    pub fn begin(&self) -> Uuid {
        self.sweep();
        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            LedgerEntry {
                tags: BTreeSet::new(),
                touched: Instant::now(),
            },
        );
        id
    }

    /// Record tags for `id`. Returns false if the id is unknown or expired.
    pub fn record<I, S>(&self, id: Uuid, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.touched.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(&id);
            return false;
        }
        entry.tags.extend(tags.into_iter().map(Into::into));
        entry.touched = Instant::now();
        true
    }

    /// Close `id` and return its tags.
    pub fn finish(&self, id: Uuid) -> BTreeSet<String> {
        self.entries
            .remove(&id)
            .map(|(_, entry)| entry.tags)
            .unwrap_or_default()
    }

    /// Drop every id idle for longer than the ttl, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.touched.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
