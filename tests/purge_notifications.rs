use std::sync::Arc;
use std::time::Duration;

use httpmock::MockServer;
use serde_json::json;
use tagstash::cache::{
    CacheHandler, EntryClass, GenerationGuard, MemoryBackend, NewEntry, Payload, PurgeClient,
};
use url::Url;

fn handler(server: &MockServer, backend: Arc<MemoryBackend>, guard: GenerationGuard) -> CacheHandler {
    let endpoint = Url::parse(&server.url("/cdn")).expect("endpoint");
    let client = PurgeClient::new(endpoint, Some("secret".to_string()), Duration::from_secs(2))
        .expect("purge client");
    CacheHandler::builder(backend)
        .purge_client(client)
        .generation(guard)
        .build()
}

fn page(tags: &[&str]) -> NewEntry {
    NewEntry::new(Payload::Json(json!({ "html": "<p>" }))).with_tags(tags.iter().copied())
}

#[tokio::test]
async fn durable_route_writes_purge_their_path() {
    let server = MockServer::start();
    let path = server.mock(|when, then| {
        when.method("POST")
            .path("/cdn/purge/path/blog/first")
            .header("authorization", "Bearer secret");
        then.status(204);
    });

    let handler = handler(&server, Arc::new(MemoryBackend::new()), GenerationGuard::disabled());
    handler.set("/blog/first", EntryClass::Durable, page(&[])).await;
    handler.set("/blog/first", EntryClass::Ephemeral, page(&[])).await;
    handler.set("fetch-key", EntryClass::Durable, page(&[])).await;
    handler.shutdown().await;

    path.assert_calls(1);
}

#[tokio::test]
async fn revalidation_purges_tag_and_deleted_routes() {
    let server = MockServer::start();
    let tag = server.mock(|when, then| {
        when.method("POST").path("/cdn/purge/tag/posts");
        then.status(200);
    });
    let route = server.mock(|when, then| {
        when.method("POST").path("/cdn/purge/path/blog/second");
        then.status(200);
    });

    let handler = handler(&server, Arc::new(MemoryBackend::new()), GenerationGuard::disabled());
    handler
        .set("/blog/second", EntryClass::Ephemeral, page(&["posts"]))
        .await;
    assert_eq!(handler.revalidate_by_tag(&["posts".to_string()]).await, 1);
    handler.shutdown().await;

    tag.assert_calls(1);
    route.assert_calls(1);
}

#[tokio::test]
async fn failing_edge_never_blocks_cache_operations() {
    let server = MockServer::start();
    let failing = server.mock(|when, then| {
        when.method("POST");
        then.status(503);
    });

    let handler = handler(&server, Arc::new(MemoryBackend::new()), GenerationGuard::disabled());
    assert!(handler.set("/", EntryClass::Durable, page(&["home"])).await);
    assert_eq!(handler.revalidate_by_tag(&["home".to_string()]).await, 1);
    handler.shutdown().await;

    failing.assert_calls(3);
}

#[tokio::test]
async fn generation_change_purges_everything() {
    let server = MockServer::start();
    let all = server.mock(|when, then| {
        when.method("POST").path("/cdn/purge/all");
        then.status(200);
    });

    let backend = Arc::new(MemoryBackend::new());
    let first = handler(
        &server,
        backend.clone(),
        GenerationGuard::new(Some("one".to_string()), false, Vec::new()),
    );
    first.check_generation().await;
    first.shutdown().await;
    all.assert_calls(0);

    let second = handler(
        &server,
        backend,
        GenerationGuard::new(Some("two".to_string()), false, Vec::new()),
    );
    second.check_generation().await;
    second.shutdown().await;
    all.assert_calls(1);
}
