//! Networked object-store backend.
//!
//! Speaks a minimal HTTP object API: `GET`/`PUT`/`DELETE {base}/{name}` for
//! documents and `GET {base}?prefix=<p>` returning `{"keys": [...]}` for
//! listing. A `429` answer is surfaced as [`BackendError::RateLimited`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::{BackendError, StorageBackend, validate_name};

const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    client: Client,
    base: Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    keys: Vec<String>,
}

impl ObjectStoreBackend {
    pub fn new(base: Url, token: Option<String>) -> Result<Self, BackendError> {
        if base.cannot_be_a_base() {
            return Err(BackendError::InvalidName(base.to_string()));
        }
        let client = Client::builder()
            .user_agent(concat!("tagstash/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn document_url(&self, name: &str) -> Result<Url, BackendError> {
        validate_name(name)?;
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidName(name.to_string()))?
            .pop_if_empty()
            .extend(name.split('/'));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn check_status(response: &Response) -> Result<(), BackendError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BackendError::RateLimited);
    }
    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
        });
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "object"
    }

    fn flush_interval(&self) -> Duration {
        FLUSH_INTERVAL
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>, BackendError> {
        let url = self.document_url(name)?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(&response)?;
        Ok(Some(response.bytes().await?))
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<(), BackendError> {
        let url = self.document_url(name)?;
        let response = self.request(Method::PUT, url).body(data).send().await?;
        check_status(&response)
    }

    async fn delete(&self, name: &str) -> Result<bool, BackendError> {
        let url = self.document_url(name)?;
        let response = self.request(Method::DELETE, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(&response)?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair("prefix", prefix);
        let response = self.request(Method::GET, url).send().await?;
        check_status(&response)?;

        let ListResponse { mut keys } = response.json().await?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        debug!(prefix, count = keys.len(), "Listed object store documents");
        Ok(keys)
    }
}
