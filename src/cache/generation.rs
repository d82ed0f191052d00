//! Deployment-generation change detection.
//!
//! The stored marker records which generation last wrote durable entries.
//! When a process starts under a different generation, durable entries from
//! the previous one are wiped before anything is served. The check runs at
//! most once per guard, and the guard is created once per process and handed
//! to the cache handler at startup.

use std::collections::BTreeSet;

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::backend::SharedBackend;
use super::error::CacheError;
use super::keys::{EntryClass, GENERATION_MARKER};
use super::store::EntryStore;

const METRIC_GENERATION_WIPE_TOTAL: &str = "tagstash_generation_wipe_total";

/// Persisted generation marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMarker {
    pub generation_id: String,
    pub recorded_at: i64,
}

/// Result of the one-time generation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Bulk-build phase, or no generation configured.
    Skipped,
    /// No marker existed; it was written and nothing was wiped.
    FirstRun,
    Unchanged,
    /// The marker named another generation (or was unreadable); the listed
    /// durable keys were wiped.
    Changed {
        previous: Option<String>,
        wiped: Vec<String>,
    },
    /// The backend could not be consulted. The check is not repeated.
    Unavailable,
}

#[derive(Debug)]
pub struct GenerationGuard {
    generation_id: Option<String>,
    build_phase: bool,
    preserve: BTreeSet<String>,
    outcome: OnceCell<GenerationOutcome>,
}

impl GenerationGuard {
    pub fn new(
        generation_id: Option<String>,
        build_phase: bool,
        preserve: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            generation_id: generation_id.filter(|id| !id.is_empty()),
            build_phase,
            preserve: preserve.into_iter().collect(),
            outcome: OnceCell::new(),
        }
    }

    /// A guard that never wipes anything.
    pub fn disabled() -> Self {
        Self::new(None, false, Vec::new())
    }

    pub fn generation_id(&self) -> Option<&str> {
        self.generation_id.as_deref()
    }

    pub fn preserve(&self) -> &BTreeSet<String> {
        &self.preserve
    }

    /// Outcome of the check, if it already ran.
    pub fn outcome(&self) -> Option<&GenerationOutcome> {
        self.outcome.get()
    }

    /// Run the check once. Concurrent callers wait for the first one and all
    /// observe its outcome.
    pub async fn ensure_checked(&self, store: &EntryStore) -> &GenerationOutcome {
        self.outcome
            .get_or_init(|| async {
                match self.check(store).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(error = %err, kind = err.kind(), "Generation check failed, continuing without it");
                        GenerationOutcome::Unavailable
                    }
                }
            })
            .await
    }

    async fn check(&self, store: &EntryStore) -> Result<GenerationOutcome, CacheError> {
        if self.build_phase {
            info!("Build phase, generation check skipped");
            return Ok(GenerationOutcome::Skipped);
        }
        let Some(current) = self.generation_id.as_deref() else {
            return Ok(GenerationOutcome::Skipped);
        };

        let backend = store.backend();
        let raw = backend
            .get(GENERATION_MARKER)
            .await
            .map_err(|err| CacheError::backend("generation_read", err))?;

        let previous = match raw {
            None => {
                self.record(backend, current, store.now_ms()).await?;
                info!(generation = current, "First run, generation marker recorded");
                return Ok(GenerationOutcome::FirstRun);
            }
            Some(raw) => match serde_json::from_slice::<GenerationMarker>(&raw) {
                Ok(marker) if marker.generation_id == current => {
                    return Ok(GenerationOutcome::Unchanged);
                }
                Ok(marker) => Some(marker.generation_id),
                Err(err) => {
                    warn!(error = %err, "Unreadable generation marker, treating as changed");
                    None
                }
            },
        };

        let wiped = store.clear_class(EntryClass::Durable, &self.preserve).await?;
        self.record(backend, current, store.now_ms()).await?;
        store.index().delete_keys(wiped.iter().cloned());
        store.notifier().generation_wiped();
        counter!(METRIC_GENERATION_WIPE_TOTAL).increment(1);
        info!(
            generation = current,
            previous = previous.as_deref().unwrap_or("unknown"),
            wiped = wiped.len(),
            preserved = self.preserve.len(),
            "Generation changed, durable entries wiped"
        );
        Ok(GenerationOutcome::Changed { previous, wiped })
    }

    async fn record(
        &self,
        backend: &SharedBackend,
        generation_id: &str,
        now_ms: i64,
    ) -> Result<(), CacheError> {
        let marker = GenerationMarker {
            generation_id: generation_id.to_string(),
            recorded_at: now_ms,
        };
        let raw = serde_json::to_vec(&marker)
            .map_err(|err| CacheError::serialization(GENERATION_MARKER, err))?;
        backend
            .put(GENERATION_MARKER, Bytes::from(raw))
            .await
            .map_err(|err| CacheError::backend("generation_write", err))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::codec::Payload;
    use crate::cache::entry::{LookupHints, NewEntry};
    use crate::cache::notifier::InvalidationNotifier;
    use crate::cache::tag_index::TagIndex;
    use crate::util::clock::ManualClock;

    fn setup() -> (Arc<MemoryBackend>, SharedBackend, EntryStore) {
        let memory = Arc::new(MemoryBackend::new());
        let backend: SharedBackend = memory.clone();
        let store = EntryStore::new(
            backend.clone(),
            Arc::new(ManualClock::new(5)),
            TagIndex::new(backend.clone()),
            InvalidationNotifier::disabled(),
        );
        (memory, backend, store)
    }

    async fn put_marker(backend: &SharedBackend, id: &str) {
        let raw = serde_json::to_vec(&json!({"generation_id": id, "recorded_at": 1})).unwrap();
        backend.put(GENERATION_MARKER, Bytes::from(raw)).await.unwrap();
    }

    async fn seed(store: &EntryStore, class: EntryClass, key: &str) {
        store
            .set(key, class, NewEntry::new(Payload::Json(json!(key))))
            .await;
    }

    #[tokio::test]
    async fn first_run_records_marker_without_wiping() {
        let (memory, _backend, store) = setup();
        seed(&store, EntryClass::Durable, "page").await;

        let guard = GenerationGuard::new(Some("v1".to_string()), false, Vec::new());
        assert_eq!(
            guard.ensure_checked(&store).await,
            &GenerationOutcome::FirstRun
        );

        assert!(memory.contains(GENERATION_MARKER));
        assert!(
            store
                .get("page", EntryClass::Durable, &LookupHints::default())
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn changed_generation_wipes_durable_except_preserved() {
        let (_memory, backend, store) = setup();
        put_marker(&backend, "v1").await;
        seed(&store, EntryClass::Durable, "staticRoute").await;
        seed(&store, EntryClass::Durable, "dynamicRoute").await;
        seed(&store, EntryClass::Ephemeral, "fetch").await;

        let guard = GenerationGuard::new(
            Some("v2".to_string()),
            false,
            vec!["staticRoute".to_string()],
        );
        let outcome = guard.ensure_checked(&store).await.clone();
        assert_eq!(
            outcome,
            GenerationOutcome::Changed {
                previous: Some("v1".to_string()),
                wiped: vec!["dynamicRoute".to_string()],
            }
        );

        let hints = LookupHints::default();
        assert!(store.get("staticRoute", EntryClass::Durable, &hints).await.is_some());
        assert!(store.get("dynamicRoute", EntryClass::Durable, &hints).await.is_none());
        assert!(store.get("fetch", EntryClass::Ephemeral, &hints).await.is_some());

        let raw = backend.get(GENERATION_MARKER).await.unwrap().unwrap();
        let marker: GenerationMarker = serde_json::from_slice(&raw).unwrap();
        assert_eq!(marker.generation_id, "v2");
        assert_eq!(marker.recorded_at, 5);
    }

    #[tokio::test]
    async fn same_generation_is_unchanged() {
        let (_memory, backend, store) = setup();
        put_marker(&backend, "v1").await;
        seed(&store, EntryClass::Durable, "page").await;

        let guard = GenerationGuard::new(Some("v1".to_string()), false, Vec::new());
        assert_eq!(
            guard.ensure_checked(&store).await,
            &GenerationOutcome::Unchanged
        );
        assert!(
            store
                .get("page", EntryClass::Durable, &LookupHints::default())
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn build_phase_skips_entirely() {
        let (memory, backend, store) = setup();
        put_marker(&backend, "v1").await;
        seed(&store, EntryClass::Durable, "page").await;
        let writes_before = memory.writes_of(GENERATION_MARKER).len();

        let guard = GenerationGuard::new(Some("v2".to_string()), true, Vec::new());
        assert_eq!(
            guard.ensure_checked(&store).await,
            &GenerationOutcome::Skipped
        );
        assert_eq!(memory.writes_of(GENERATION_MARKER).len(), writes_before);
    }

    #[tokio::test]
    async fn check_runs_once_under_concurrency() {
        let (memory, backend, store) = setup();
        put_marker(&backend, "v1").await;
        let guard = GenerationGuard::new(Some("v2".to_string()), false, Vec::new());

        let (a, b, c) = tokio::join!(
            guard.ensure_checked(&store),
            guard.ensure_checked(&store),
            guard.ensure_checked(&store),
        );
        assert!(matches!(a, GenerationOutcome::Changed { .. }));
        assert_eq!(a, b);
        assert_eq!(b, c);
        // One seeded marker plus exactly one rewrite.
        assert_eq!(memory.writes_of(GENERATION_MARKER).len(), 2);

        put_marker(&backend, "v3").await;
        assert!(matches!(
            guard.ensure_checked(&store).await,
            GenerationOutcome::Changed { .. }
        ));
        assert_eq!(memory.writes_of(GENERATION_MARKER).len(), 3);
    }
}
