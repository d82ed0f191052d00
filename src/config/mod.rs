//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagstash";
const DEFAULT_DISK_ROOT: &str = ".tagstash";
const DEFAULT_PURGE_TIMEOUT_MS: u64 = 5_000;
const MAX_PURGE_TIMEOUT_MS: u64 = 10_000;

/// Command-line arguments for the tagstash binary.
#[derive(Debug, Parser)]
#[command(name = "tagstash", version, about = "Tagstash cache administration")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGSTASH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print entry statistics as JSON.
    Stats,
    /// Look up a single entry.
    Get(KeyArgs),
    /// Store a file as a binary payload.
    Put(PutArgs),
    /// Delete a single entry.
    Delete(KeyArgs),
    /// Delete every entry indexed under the given tags.
    Revalidate(TagsArgs),
    /// Mark tags as invalidated now.
    #[command(name = "expire-tags")]
    ExpireTags(TagsArgs),
    /// Print the latest invalidation time across tags.
    Expiration(TagsArgs),
    /// Delete every entry except the preserved keys.
    Clear(ClearArgs),
    /// Run the deployment-generation check and print its outcome.
    #[command(name = "check-generation")]
    CheckGeneration,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// Cache key.
    #[arg(value_name = "KEY")]
    pub key: String,

    /// Address the durable class instead of the ephemeral one.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub durable: bool,
}

#[derive(Debug, Args, Clone)]
pub struct PutArgs {
    #[command(flatten)]
    pub target: KeyArgs,

    /// File whose bytes become the payload.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Tag attached to the entry; repeatable.
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Age in seconds after which an ephemeral entry reads as absent.
    #[arg(long = "revalidate-secs", value_name = "SECONDS")]
    pub revalidate_secs: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct TagsArgs {
    #[arg(value_name = "TAG", required = true)]
    pub tags: Vec<String>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct ClearArgs {
    /// Key kept by the clear; repeatable.
    #[arg(long = "preserve", value_name = "KEY")]
    pub preserve: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the storage backend.
    #[arg(long = "backend", value_name = "KIND", value_enum)]
    pub backend: Option<BackendKind>,

    /// Override the disk backend root directory.
    #[arg(long = "disk-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub disk_root: Option<PathBuf>,

    /// Override the object store base URL.
    #[arg(long = "object-url", value_name = "URL")]
    pub object_url: Option<String>,

    /// Override the edge purge endpoint.
    #[arg(long = "purge-endpoint", value_name = "URL")]
    pub purge_endpoint: Option<String>,

    /// Override the deployment generation id.
    #[arg(long = "generation-id", value_name = "ID")]
    pub generation_id: Option<String>,

    /// Mark this process as part of a bulk build.
    #[arg(
        long = "build-phase",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub build_phase: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Disk,
    Object,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub backend: BackendSettings,
    pub purge: PurgeSettings,
    pub generation: GenerationSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub target: BackendTarget,
    /// Replaces the backend's own flush interval when set.
    pub flush_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    Disk { root: PathBuf },
    Object { url: Url, token: Option<String> },
}

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    pub endpoint: Option<Url>,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationSettings {
    pub id: Option<String>,
    pub build_phase: bool,
    pub preserve_keys: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("TAGSTASH")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("generation.preserve_keys"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
    purge: RawPurgeSettings,
    generation: RawGenerationSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(kind) = overrides.backend {
            self.backend.kind = Some(kind);
        }
        if let Some(root) = overrides.disk_root.as_ref() {
            self.backend.disk_root = Some(root.clone());
        }
        if let Some(url) = overrides.object_url.as_ref() {
            self.backend.object_url = Some(url.clone());
        }
        if let Some(endpoint) = overrides.purge_endpoint.as_ref() {
            self.purge.endpoint = Some(endpoint.clone());
        }
        if let Some(id) = overrides.generation_id.as_ref() {
            self.generation.id = Some(id.clone());
        }
        if let Some(build_phase) = overrides.build_phase {
            self.generation.build_phase = Some(build_phase);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            backend,
            purge,
            generation,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let backend = build_backend_settings(backend)?;
        let purge = build_purge_settings(purge)?;
        let generation = build_generation_settings(generation);

        Ok(Self {
            logging,
            backend,
            purge,
            generation,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let target = match backend.kind.unwrap_or(BackendKind::Disk) {
        BackendKind::Disk => BackendTarget::Disk {
            root: backend
                .disk_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DISK_ROOT)),
        },
        BackendKind::Object => {
            let url = non_empty(backend.object_url).ok_or_else(|| {
                LoadError::invalid("backend.object_url", "required when backend.kind = object")
            })?;
            BackendTarget::Object {
                url: parse_url(&url, "backend.object_url")?,
                token: non_empty(backend.object_token),
            }
        }
    };

    let flush_interval = match backend.flush_interval_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "backend.flush_interval_ms",
                "must be greater than zero",
            ));
        }
        Some(ms) => Some(Duration::from_millis(ms)),
        None => None,
    };

    Ok(BackendSettings {
        target,
        flush_interval,
    })
}

fn build_purge_settings(purge: RawPurgeSettings) -> Result<PurgeSettings, LoadError> {
    let endpoint = non_empty(purge.endpoint)
        .map(|value| parse_url(&value, "purge.endpoint"))
        .transpose()?;

    let timeout_ms = purge.timeout_ms.unwrap_or(DEFAULT_PURGE_TIMEOUT_MS);
    if !(1..=MAX_PURGE_TIMEOUT_MS).contains(&timeout_ms) {
        return Err(LoadError::invalid(
            "purge.timeout_ms",
            format!("must be between 1 and {MAX_PURGE_TIMEOUT_MS}"),
        ));
    }

    Ok(PurgeSettings {
        endpoint,
        token: non_empty(purge.token),
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_generation_settings(generation: RawGenerationSettings) -> GenerationSettings {
    GenerationSettings {
        id: non_empty(generation.id),
        build_phase: generation.build_phase.unwrap_or(false),
        preserve_keys: generation
            .preserve_keys
            .into_iter()
            .filter(|key| !key.is_empty())
            .collect(),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<BackendKind>,
    disk_root: Option<PathBuf>,
    object_url: Option<String>,
    object_token: Option<String>,
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPurgeSettings {
    endpoint: Option<String>,
    token: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGenerationSettings {
    id: Option<String>,
    build_phase: Option<bool>,
    preserve_keys: Vec<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(value).map_err(|err| LoadError::invalid(key, format!("invalid url: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(LoadError::invalid(key, "url cannot be used as a base"));
    }
    Ok(url)
}
