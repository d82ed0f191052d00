//! End-to-end behaviour of the cache engine over the in-memory backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tagstash::cache::keys::TAGS_DOCUMENT;
use tagstash::cache::{
    CacheHandler, EntryClass, GenerationGuard, GenerationOutcome, LookupHints, MapValue,
    MemoryBackend, NewEntry, Payload, PayloadStream, TagIndex, request_tags,
};
use tagstash::util::clock::ManualClock;

struct Harness {
    backend: Arc<MemoryBackend>,
    clock: Arc<ManualClock>,
    handler: CacheHandler,
}

fn harness() -> Harness {
    harness_at(1_000, GenerationGuard::disabled())
}

fn harness_at(start_ms: i64, guard: GenerationGuard) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start_ms));
    let handler = CacheHandler::builder(backend.clone())
        .clock(clock.clone())
        .generation(guard)
        .build();
    Harness {
        backend,
        clock,
        handler,
    }
}

fn page(body: &str, tags: &[&str]) -> NewEntry {
    NewEntry::new(Payload::Json(json!({ "html": body }))).with_tags(tags.iter().copied())
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[tokio::test]
async fn revalidating_a_tag_removes_every_tagged_entry() {
    let Harness { handler, .. } = harness();
    assert!(handler.set("A", EntryClass::Durable, page("a", &["posts"])).await);
    assert!(handler.set("B", EntryClass::Durable, page("b", &["posts"])).await);

    assert_eq!(handler.revalidate_by_tag(&strings(&["posts"])).await, 2);

    let hints = LookupHints::default();
    assert!(handler.get("A", EntryClass::Durable, &hints).await.is_none());
    assert!(handler.get("B", EntryClass::Durable, &hints).await.is_none());
    assert!(!handler.tags_mapping().await.contains_key("posts"));
}

#[tokio::test]
async fn ephemeral_entry_past_its_revalidate_window_reads_absent() {
    let Harness { clock, handler, .. } = harness_at(0, GenerationGuard::disabled());
    let entry = NewEntry::new(Payload::Json(json!("x"))).revalidate_after(Duration::from_secs(5));
    assert!(handler.set("X", EntryClass::Ephemeral, entry).await);

    clock.set(10_000);
    assert!(
        handler
            .get("X", EntryClass::Ephemeral, &LookupHints::default())
            .await
            .is_none()
    );
}

#[tokio::test]
async fn queued_index_additions_land_in_one_write() {
    let backend = Arc::new(MemoryBackend::with_flush_interval(Duration::from_secs(60)));
    let index = TagIndex::new(backend.clone());

    index.add_tags("k1", &strings(&["t1"]));
    index.add_tags("k2", &strings(&["t1"]));
    tokio::time::timeout(Duration::from_secs(1), index.flush())
        .await
        .expect("first write is not delayed")
        .expect("flush");

    let writes = backend.writes_of(TAGS_DOCUMENT);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0], Bytes::from_static(br#"{"t1":["k1","k2"]}"#));

    tokio::time::timeout(Duration::from_secs(1), index.flush())
        .await
        .expect("nothing queued, nothing to wait for")
        .expect("flush");
    assert_eq!(backend.writes_of(TAGS_DOCUMENT).len(), 1);
}

#[tokio::test]
async fn clear_all_keeps_preserved_keys() {
    let Harness { handler, .. } = harness();
    handler.set("staticRoute", EntryClass::Durable, page("s", &[])).await;
    handler.set("dynamicRoute", EntryClass::Durable, page("d", &[])).await;

    let preserve = BTreeSet::from(["staticRoute".to_string()]);
    assert_eq!(handler.clear_all(&preserve).await, 1);

    let hints = LookupHints::default();
    assert!(handler.get("staticRoute", EntryClass::Durable, &hints).await.is_some());
    assert!(handler.get("dynamicRoute", EntryClass::Durable, &hints).await.is_none());
}

#[tokio::test]
async fn new_generation_wipes_durable_entries_on_first_use() {
    let first = harness_at(1_000, GenerationGuard::new(Some("v1".to_string()), false, Vec::new()));
    first
        .handler
        .set("/blog/post", EntryClass::Durable, page("p", &["posts"]))
        .await;
    first
        .handler
        .set("/about", EntryClass::Durable, page("about", &[]))
        .await;
    first
        .handler
        .set("fetch", EntryClass::Ephemeral, page("f", &[]))
        .await;
    first.handler.shutdown().await;

    let guard = GenerationGuard::new(
        Some("v2".to_string()),
        false,
        vec!["/about".to_string()],
    );
    let second = CacheHandler::builder(first.backend.clone())
        .clock(first.clock.clone())
        .generation(guard)
        .build();

    let hints = LookupHints::default();
    assert!(second.get("/blog/post", EntryClass::Durable, &hints).await.is_none());
    assert!(second.get("/about", EntryClass::Durable, &hints).await.is_some());
    assert!(second.get("fetch", EntryClass::Ephemeral, &hints).await.is_some());
    assert_eq!(
        second.check_generation().await,
        GenerationOutcome::Changed {
            previous: Some("v1".to_string()),
            wiped: vec!["/blog/post".to_string()],
        }
    );
    assert!(second.tags_mapping().await.is_empty());
}

#[tokio::test]
async fn build_workers_never_wipe() {
    let first = harness_at(1_000, GenerationGuard::new(Some("v1".to_string()), false, Vec::new()));
    first.handler.set("/", EntryClass::Durable, page("home", &[])).await;

    let worker = CacheHandler::builder(first.backend.clone())
        .clock(first.clock.clone())
        .generation(GenerationGuard::new(Some("v2".to_string()), true, Vec::new()))
        .build();
    assert!(
        worker
            .get("/", EntryClass::Durable, &LookupHints::default())
            .await
            .is_some()
    );
    assert_eq!(worker.check_generation().await, GenerationOutcome::Skipped);
}

#[tokio::test]
async fn request_scope_collects_tags_of_served_entries() {
    let Harness { handler, .. } = harness();
    handler.set("a", EntryClass::Ephemeral, page("a", &["posts", "home"])).await;
    handler.set("b", EntryClass::Ephemeral, page("b", &["users"])).await;

    let hints = LookupHints::default();
    let (_, tags) = request_tags::run(async {
        handler.get("a", EntryClass::Ephemeral, &hints).await;
        handler.get("missing", EntryClass::Ephemeral, &hints).await;
    })
    .await;
    assert_eq!(tags, BTreeSet::from(["home".to_string(), "posts".to_string()]));

    let (first, second) = tokio::join!(
        request_tags::run(handler.get("a", EntryClass::Ephemeral, &hints)),
        request_tags::run(handler.get("b", EntryClass::Ephemeral, &hints)),
    );
    assert!(first.1.contains("posts"));
    assert!(!first.1.contains("users"));
    assert_eq!(second.1, BTreeSet::from(["users".to_string()]));
}

#[tokio::test]
async fn soft_tag_invalidation_hides_untagged_entries() {
    let Harness { clock, handler, .. } = harness();
    handler.set("/feed", EntryClass::Durable, page("feed", &[])).await;

    clock.advance(Duration::from_secs(1));
    handler.update_tags(&strings(&["_N_T_/feed"])).await;

    assert!(
        handler
            .get("/feed", EntryClass::Durable, &LookupHints::default())
            .await
            .is_some()
    );
    assert!(
        handler
            .get(
                "/feed",
                EntryClass::Durable,
                &LookupHints::with_soft_tags(["_N_T_/feed"])
            )
            .await
            .is_none()
    );
}

#[tokio::test]
async fn payload_shapes_survive_storage() {
    let Harness { handler, .. } = harness();
    let map = BTreeMap::from([
        ("meta".to_string(), MapValue::Json(json!({ "status": 200 }))),
        (
            "body".to_string(),
            MapValue::Binary(Bytes::from_static(&[0, 159, 146, 150])),
        ),
    ]);
    handler
        .set("map", EntryClass::Durable, NewEntry::new(Payload::Map(map.clone())))
        .await;
    handler
        .set(
            "stream",
            EntryClass::Ephemeral,
            NewEntry::new(Payload::Stream(PayloadStream::from_bytes(Bytes::from_static(
                b"chunked body",
            )))),
        )
        .await;

    let hints = LookupHints::default();
    let stored = handler
        .get("map", EntryClass::Durable, &hints)
        .await
        .expect("map entry");
    assert_eq!(stored.payload, Payload::Map(map));

    let streamed = handler
        .get("stream", EntryClass::Ephemeral, &hints)
        .await
        .expect("stream entry");
    assert_eq!(
        streamed.payload.buffered().await.expect("drain"),
        Payload::Binary(Bytes::from_static(b"chunked body"))
    );
}

#[tokio::test]
async fn expiration_is_shared_between_handlers_on_one_backend() {
    let first = harness();
    first.clock.set(42_000);
    first.handler.update_tags(&strings(&["posts"])).await;
    first.handler.shutdown().await;

    let second = CacheHandler::builder(first.backend.clone())
        .clock(first.clock.clone())
        .build();
    assert_eq!(
        second
            .expiration_for_tags(&strings(&["users", "posts"]))
            .await,
        42_000
    );
    assert_eq!(second.expiration_for_tags(&[]).await, 0);
}

#[tokio::test]
async fn invalidation_from_another_handler_reaches_a_warm_reader() {
    let backend = Arc::new(MemoryBackend::with_flush_interval(Duration::from_millis(10)));
    let clock = Arc::new(ManualClock::new(1_000));
    let reader = CacheHandler::builder(backend.clone())
        .clock(clock.clone())
        .build();
    let writer = CacheHandler::builder(backend)
        .clock(clock.clone())
        .build();
    let hints = LookupHints::default();

    reader.set("k", EntryClass::Durable, page("k", &["feed"])).await;
    assert!(reader.get("k", EntryClass::Durable, &hints).await.is_some());

    clock.set(2_000);
    writer.update_tags(&strings(&["feed"])).await;
    writer.shutdown().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(reader.expiration_for_tags(&strings(&["feed"])).await, 2_000);
    assert!(reader.get("k", EntryClass::Durable, &hints).await.is_none());
    reader.shutdown().await;
}

#[tokio::test]
async fn retagged_entry_is_not_revalidated_by_its_old_tag() {
    let Harness { handler, .. } = harness();
    handler.set("k", EntryClass::Durable, page("v1", &["old"])).await;
    assert!(handler.tags_mapping().await.contains_key("old"));

    assert!(handler.delete("k", EntryClass::Durable).await);
    handler.set("k", EntryClass::Durable, page("v2", &["new"])).await;

    let mapping = handler.tags_mapping().await;
    assert!(!mapping.contains_key("old"));
    assert_eq!(mapping["new"], BTreeSet::from(["k".to_string()]));

    assert_eq!(handler.revalidate_by_tag(&strings(&["old"])).await, 0);
    assert!(
        handler
            .get("k", EntryClass::Durable, &LookupHints::default())
            .await
            .is_some()
    );
}
