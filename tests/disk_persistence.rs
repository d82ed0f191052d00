use std::collections::BTreeSet;

use bytes::Bytes;
use serde_json::Value;
use tagstash::cache::{
    CacheConfig, CacheHandler, EntryClass, GenerationOutcome, LookupHints, NewEntry, Payload,
};
use tagstash::config::BackendTarget;
use tempfile::TempDir;

fn config(dir: &TempDir, generation: Option<&str>) -> CacheConfig {
    CacheConfig {
        backend: BackendTarget::Disk {
            root: dir.path().to_path_buf(),
        },
        generation_id: generation.map(str::to_string),
        ..CacheConfig::default()
    }
}

fn binary(data: &'static [u8], tags: &[&str]) -> NewEntry {
    NewEntry::new(Payload::Binary(Bytes::from_static(data))).with_tags(tags.iter().copied())
}

#[tokio::test]
async fn entries_and_tags_survive_a_restart() {
    let dir = TempDir::new().expect("temp dir");

    let handler = CacheHandler::open(&config(&dir, None)).expect("open");
    assert!(
        handler
            .set("/blog/hello world", EntryClass::Durable, binary(b"<html>", &["posts"]))
            .await
    );
    handler.shutdown().await;

    let raw = std::fs::read(dir.path().join("meta/tags.json")).expect("tags document");
    let mapping: Value = serde_json::from_slice(&raw).expect("json");
    assert_eq!(mapping["posts"][0], "/blog/hello world");

    let reopened = CacheHandler::open(&config(&dir, None)).expect("reopen");
    let entry = reopened
        .get("/blog/hello world", EntryClass::Durable, &LookupHints::default())
        .await
        .expect("entry after restart");
    assert_eq!(entry.payload, Payload::Binary(Bytes::from_static(b"<html>")));
    assert_eq!(entry.tags, BTreeSet::from(["posts".to_string()]));

    assert_eq!(reopened.revalidate_by_tag(&["posts".to_string()]).await, 1);
    reopened.shutdown().await;
    assert_eq!(reopened.stats().await.count, 0);
}

#[tokio::test]
async fn stats_report_sizes_and_classes() {
    let dir = TempDir::new().expect("temp dir");
    let handler = CacheHandler::open(&config(&dir, None)).expect("open");

    handler.set("page", EntryClass::Durable, binary(b"abcdef", &[])).await;
    handler.set("fetch", EntryClass::Ephemeral, binary(b"xy", &["api"])).await;

    let stats = handler.stats().await;
    assert_eq!(stats.count, 2);
    let fetch = stats
        .entries
        .iter()
        .find(|entry| entry.key == "fetch")
        .expect("fetch listed");
    assert_eq!(fetch.class, EntryClass::Ephemeral);
    assert!(fetch.tags.contains("api"));
    assert_eq!(fetch.size_bytes, 2);
    handler.shutdown().await;
}

#[tokio::test]
async fn generation_marker_lives_on_disk() {
    let dir = TempDir::new().expect("temp dir");

    let first = CacheHandler::open(&config(&dir, Some("build-1"))).expect("open");
    assert_eq!(first.check_generation().await, GenerationOutcome::FirstRun);
    first.set("/", EntryClass::Durable, binary(b"home", &[])).await;
    first.shutdown().await;
    assert!(dir.path().join("meta/generation.json").is_file());

    let same = CacheHandler::open(&config(&dir, Some("build-1"))).expect("open");
    assert_eq!(same.check_generation().await, GenerationOutcome::Unchanged);

    let next = CacheHandler::open(&config(&dir, Some("build-2"))).expect("open");
    assert!(matches!(
        next.check_generation().await,
        GenerationOutcome::Changed { .. }
    ));
    assert!(
        next.get("/", EntryClass::Durable, &LookupHints::default())
            .await
            .is_none()
    );
    next.shutdown().await;
}
