//! Cache engine configuration.
//!
//! Derived from the validated [`crate::config::Settings`]; embedders that do
//! not use the settings loader can build it directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::backend::{BackendError, DiskBackend, ObjectStoreBackend, SharedBackend};
use super::error::CacheError;
use super::generation::GenerationGuard;
use super::notifier::{DEFAULT_PURGE_TIMEOUT, PurgeClient};
use crate::config::{BackendTarget, Settings};

const DEFAULT_DISK_ROOT: &str = ".tagstash";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: BackendTarget,
    /// Overrides the backend's own flush interval.
    pub flush_interval: Option<Duration>,
    /// Edge purge endpoint; `None` turns purge notifications off.
    pub purge_endpoint: Option<Url>,
    pub purge_token: Option<String>,
    pub purge_timeout: Duration,
    pub generation_id: Option<String>,
    /// Skip the generation check, as parallel build workers must.
    pub build_phase: bool,
    /// Durable keys that survive a generation change.
    pub preserve_keys: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendTarget::Disk {
                root: PathBuf::from(DEFAULT_DISK_ROOT),
            },
            flush_interval: None,
            purge_endpoint: None,
            purge_token: None,
            purge_timeout: DEFAULT_PURGE_TIMEOUT,
            generation_id: None,
            build_phase: false,
            preserve_keys: Vec::new(),
        }
    }
}

impl From<&Settings> for CacheConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            backend: settings.backend.target.clone(),
            flush_interval: settings.backend.flush_interval,
            purge_endpoint: settings.purge.endpoint.clone(),
            purge_token: settings.purge.token.clone(),
            purge_timeout: settings.purge.timeout,
            generation_id: settings.generation.id.clone(),
            build_phase: settings.generation.build_phase,
            preserve_keys: settings.generation.preserve_keys.clone(),
        }
    }
}

impl CacheConfig {
    pub fn open_backend(&self) -> Result<SharedBackend, CacheError> {
        match &self.backend {
            BackendTarget::Disk { root } => {
                let backend = DiskBackend::new(root.clone())
                    .map_err(|err| CacheError::backend("open", BackendError::Io(err)))?;
                Ok(Arc::new(backend))
            }
            BackendTarget::Object { url, token } => {
                let backend = ObjectStoreBackend::new(url.clone(), token.clone())
                    .map_err(|err| CacheError::backend("open", err))?;
                Ok(Arc::new(backend))
            }
        }
    }

    pub fn purge_client(&self) -> Result<Option<PurgeClient>, CacheError> {
        self.purge_endpoint
            .clone()
            .map(|endpoint| PurgeClient::new(endpoint, self.purge_token.clone(), self.purge_timeout))
            .transpose()
    }

    pub fn generation_guard(&self) -> GenerationGuard {
        GenerationGuard::new(
            self.generation_id.clone(),
            self.build_phase,
            self.preserve_keys.iter().cloned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn default_targets_local_disk_without_purge() {
        let config = CacheConfig::default();
        assert!(matches!(config.backend, BackendTarget::Disk { .. }));
        assert!(config.purge_client().unwrap().is_none());
        assert_eq!(config.purge_timeout, Duration::from_secs(5));
    }

    #[test]
    fn disk_backend_opens_under_root() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            backend: BackendTarget::Disk {
                root: dir.path().join("cache"),
            },
            ..CacheConfig::default()
        };

        let backend = config.open_backend().expect("backend");
        assert_eq!(backend.name(), "disk");
        assert_eq!(backend.flush_interval(), Duration::from_millis(100));
        assert!(dir.path().join("cache").is_dir());
    }

    #[test]
    fn object_backend_uses_its_own_interval() {
        let config = CacheConfig {
            backend: BackendTarget::Object {
                url: Url::parse("https://store.example/bucket").unwrap(),
                token: None,
            },
            ..CacheConfig::default()
        };

        let backend = config.open_backend().expect("backend");
        assert_eq!(backend.name(), "object");
        assert_eq!(backend.flush_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn guard_carries_generation_settings() {
        let config = CacheConfig {
            generation_id: Some("v7".to_string()),
            build_phase: true,
            preserve_keys: vec!["staticRoute".to_string()],
            ..CacheConfig::default()
        };

        let guard = config.generation_guard();
        assert_eq!(guard.generation_id(), Some("v7"));
        assert!(guard.preserve().contains("staticRoute"));
    }
}
