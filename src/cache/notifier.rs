//! Best-effort purge calls to an edge cache.
//!
//! Every call is spawned onto the runtime and forgotten: the caller never waits
//! for it and never sees its outcome. Each request carries its own timeout and
//! listens to a shared cancellation signal. Failures are logged and counted,
//! never retried.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use reqwest::{Client, Url};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::keys::route_path;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::notifier";
const METRIC_PURGE_TOTAL: &str = "tagstash_purge_total";

pub const DEFAULT_PURGE_TIMEOUT: Duration = Duration::from_secs(5);

/// One purge operation understood by the edge service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PurgeTarget {
    All,
    Path(String),
    Tag(String),
}

impl PurgeTarget {
    /// Purge for a route path. The root has no segment to encode, so it
    /// becomes a full purge.
    pub fn for_path(path: &str) -> Self {
        if path.split('/').all(str::is_empty) {
            Self::All
        } else {
            Self::Path(path.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Path(_) => "path",
            Self::Tag(_) => "tag",
        }
    }

    /// `{endpoint}/purge/all`, `{endpoint}/purge/path/<seg>/<seg>...` or
    /// `{endpoint}/purge/tag/<tag>`, each segment percent-encoded on its own.
    pub fn url(&self, endpoint: &Url) -> Result<Url, CacheError> {
        let mut url = endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                CacheError::NotificationFailure(format!("endpoint `{endpoint}` cannot be a base"))
            })?;
            segments.pop_if_empty().push("purge");
            match self {
                Self::All => {
                    segments.push("all");
                }
                Self::Path(path) => {
                    segments
                        .push("path")
                        .extend(path.split('/').filter(|segment| !segment.is_empty()));
                }
                Self::Tag(tag) => {
                    segments.push("tag").push(tag);
                }
            }
        }
        Ok(url)
    }
}

/// Outbound client for the purge endpoint.
#[derive(Debug, Clone)]
pub struct PurgeClient {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    timeout: Duration,
}

impl PurgeClient {
    pub fn new(endpoint: Url, token: Option<String>, timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::builder()
            .user_agent(concat!("tagstash/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| CacheError::NotificationFailure(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            token,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Issue one purge request, bounded by the client timeout.
    pub async fn purge(&self, target: &PurgeTarget) -> Result<(), CacheError> {
        let url = target.url(&self.endpoint)?;
        let mut request = self.client.post(url).timeout(self.timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| CacheError::NotificationFailure(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(CacheError::NotificationFailure(format!(
            "purge endpoint answered {status}"
        )))
    }
}

/// Fire-and-forget dispatcher for purge calls.
///
/// Without a configured client every notification is a no-op.
#[derive(Clone)]
pub struct InvalidationNotifier {
    inner: Arc<Inner>,
}

struct Inner {
    client: Option<PurgeClient>,
    tasks: Mutex<JoinSet<()>>,
    cancel: watch::Sender<bool>,
}

impl InvalidationNotifier {
    pub fn new(client: Option<PurgeClient>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client,
                tasks: Mutex::new(JoinSet::new()),
                cancel,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.client.is_some()
    }

    /// After a tag revalidation: purge each tag and the route of each deleted
    /// key. Nothing is sent when no entry was deleted.
    pub fn tags_revalidated(&self, tags: &[String], deleted_keys: &[String]) {
        if deleted_keys.is_empty() {
            return;
        }
        let mut targets: BTreeSet<PurgeTarget> = tags
            .iter()
            .filter(|tag| !tag.is_empty())
            .map(|tag| PurgeTarget::Tag(tag.clone()))
            .collect();
        targets.extend(
            deleted_keys
                .iter()
                .filter_map(|key| route_path(key))
                .map(PurgeTarget::for_path),
        );
        for target in targets {
            self.dispatch(target);
        }
    }

    /// After a durable entry was written.
    pub fn entry_updated(&self, key: &str) {
        if let Some(path) = route_path(key) {
            self.dispatch(PurgeTarget::for_path(path));
        }
    }

    /// After a generation change wiped durable entries.
    pub fn generation_wiped(&self) {
        self.dispatch(PurgeTarget::All);
    }

    /// Wait for every call dispatched so far.
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *mutex_lock(&self.inner.tasks, SOURCE, "settle"));
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "Purge task did not complete");
            }
        }
    }

    /// Abort in-flight calls. Later notifications are dropped.
    pub fn cancel(&self) {
        self.inner.cancel.send_replace(true);
    }

    fn dispatch(&self, target: PurgeTarget) {
        let Some(client) = self.inner.client.clone() else {
            return;
        };
        if *self.inner.cancel.borrow() {
            debug!(kind = target.kind(), "Notifier cancelled, purge dropped");
            return;
        }
        if Handle::try_current().is_err() {
            warn!(kind = target.kind(), "No async runtime, purge dropped");
            return;
        }

        let mut cancelled = self.inner.cancel.subscribe();
        let mut tasks = mutex_lock(&self.inner.tasks, SOURCE, "dispatch");
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            tokio::select! {
                result = client.purge(&target) => record(&target, result),
                _ = cancelled.wait_for(|cancelled| *cancelled) => {
                    counter!(METRIC_PURGE_TOTAL, "kind" => target.kind(), "result" => "cancelled")
                        .increment(1);
                    debug!(kind = target.kind(), "Purge cancelled");
                }
            }
        });
    }
}

fn record(target: &PurgeTarget, result: Result<(), CacheError>) {
    match result {
        Ok(()) => {
            counter!(METRIC_PURGE_TOTAL, "kind" => target.kind(), "result" => "ok").increment(1);
            info!(target = ?target, "Edge cache purged");
        }
        Err(err) => {
            counter!(METRIC_PURGE_TOTAL, "kind" => target.kind(), "result" => "error")
                .increment(1);
            warn!(target = ?target, error = %err, "Edge cache purge failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    fn notifier(server: &MockServer, timeout: Duration) -> InvalidationNotifier {
        let endpoint = Url::parse(&server.url("/edge")).expect("endpoint");
        let client = PurgeClient::new(endpoint, Some("token".to_string()), timeout).expect("client");
        InvalidationNotifier::new(Some(client))
    }

    #[test]
    fn path_segments_are_encoded_independently() {
        let endpoint = Url::parse("https://edge.example/api/").unwrap();
        let url = PurgeTarget::for_path("/blog/a b/c%d")
            .url(&endpoint)
            .unwrap();
        assert_eq!(url.as_str(), "https://edge.example/api/purge/path/blog/a%20b/c%25d");

        let tag = PurgeTarget::Tag("a/b".to_string()).url(&endpoint).unwrap();
        assert_eq!(tag.as_str(), "https://edge.example/api/purge/tag/a%2Fb");
    }

    #[test]
    fn root_path_becomes_full_purge() {
        assert_eq!(PurgeTarget::for_path("/"), PurgeTarget::All);
        assert_eq!(PurgeTarget::for_path(""), PurgeTarget::All);
        assert_eq!(
            PurgeTarget::for_path("/blog/"),
            PurgeTarget::Path("/blog/".to_string())
        );
    }

    #[tokio::test]
    async fn revalidation_purges_tags_and_routes() {
        let server = MockServer::start();
        let tag = server.mock(|when, then| {
            when.method("POST")
                .path("/edge/purge/tag/posts")
                .header("authorization", "Bearer token");
            then.status(200);
        });
        let path = server.mock(|when, then| {
            when.method("POST").path("/edge/purge/path/blog/hello");
            then.status(200);
        });

        let notifier = notifier(&server, DEFAULT_PURGE_TIMEOUT);
        notifier.tags_revalidated(
            &["posts".to_string()],
            &["/blog/hello".to_string(), "fetch-cache-entry".to_string()],
        );
        notifier.settle().await;

        tag.assert();
        path.assert();
    }

    #[tokio::test]
    async fn nothing_is_sent_without_deleted_keys() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST");
            then.status(200);
        });

        let notifier = notifier(&server, DEFAULT_PURGE_TIMEOUT);
        notifier.tags_revalidated(&["posts".to_string()], &[]);
        notifier.entry_updated("not-a-route");
        notifier.settle().await;

        mock.assert_calls(0);
    }

    #[tokio::test]
    async fn root_route_update_purges_everything() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST").path("/edge/purge/all");
            then.status(200);
        });

        let notifier = notifier(&server, DEFAULT_PURGE_TIMEOUT);
        notifier.entry_updated("/");
        notifier.settle().await;

        mock.assert();
    }

    #[tokio::test]
    async fn failures_and_timeouts_are_swallowed() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method("POST").path("/edge/purge/all");
            then.status(500);
        });
        server.mock(|when, then| {
            when.method("POST").path("/edge/purge/path/slow");
            then.status(200).delay(Duration::from_secs(3));
        });

        let notifier = notifier(&server, Duration::from_millis(50));
        notifier.generation_wiped();
        notifier.entry_updated("/slow");
        tokio::time::timeout(Duration::from_secs(2), notifier.settle())
            .await
            .expect("timed out calls settle");

        failing.assert();
    }

    #[tokio::test]
    async fn cancel_stops_in_flight_calls() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST");
            then.status(200).delay(Duration::from_secs(5));
        });

        let notifier = notifier(&server, Duration::from_secs(10));
        notifier.generation_wiped();
        notifier.cancel();

        tokio::time::timeout(Duration::from_secs(1), notifier.settle())
            .await
            .expect("cancelled calls settle promptly");
    }

    #[tokio::test]
    async fn disabled_notifier_is_a_no_op() {
        let notifier = InvalidationNotifier::disabled();
        assert!(!notifier.is_enabled());
        notifier.generation_wiped();
        notifier.settle().await;
    }
}
