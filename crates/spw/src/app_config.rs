//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." -- every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment: `SPW_*` environment variables merged with an optional
//! TOML file (the file wins). Then [`AppConfig::validate`] rejects the knob
//! combinations that would parse fine and still ruin your night.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{DirectoryBackupConfig, ElasticsearchSinkConfig, FileSinkConfig, SpoolQueueConfig};
use crate::compression::CompressionFormat;

/// ⏳ Upper bound on `retry_duration_secs`. Two hours of hoping is plenty.
pub const MAX_RETRY_DURATION_SECS: u64 = 7200;
/// 📬 Queue polls hand out at most this many records at a time.
pub const MAX_RECORDS_PER_POLL: usize = 10;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 📬 Where records come from.
    pub queue_config: QueueConfig,
    /// 🕳️ Where batches go on a good day.
    pub sink_config: SinkConfig,
    /// 🧯 Where batches go on a bad day.
    pub backup_config: BackupConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// 🧹 Optional subscription filter, applied once at startup.
    #[serde(default)]
    pub filter_policy: Option<FilterPolicyConfig>,
}

/// 📬 Record queue backends.
#[derive(Debug, Deserialize, Clone)]
pub enum QueueConfig {
    /// 🧪 Lives and dies with the process. Tests and demos only.
    InMemory,
    Spool(SpoolQueueConfig),
}

/// 🕳️ Sink backends.
#[derive(Debug, Deserialize, Clone)]
pub enum SinkConfig {
    InMemory,
    File(FileSinkConfig),
    Elasticsearch(ElasticsearchSinkConfig),
}

/// 🧯 Backup store backends.
#[derive(Debug, Deserialize, Clone)]
pub enum BackupStoreConfig {
    InMemory,
    Directory(DirectoryBackupConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    /// 🏷️ Prepended verbatim to every backup key. `failed/` gives you a folder.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub compression: CompressionFormat,
    pub store: BackupStoreConfig,
}

/// 🎛️ Buffering, retry and delivery knobs for the pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// ⏳ How long a failing batch keeps retrying before it is backed up. 0..=7200.
    #[serde(default = "default_retry_duration_secs")]
    pub retry_duration_secs: u64,
    /// 📏 A batch seals once it holds at least this many bytes.
    #[serde(default = "default_size_threshold_bytes", alias = "buffer_size_bytes")]
    pub size_threshold_bytes: usize,
    /// ⏰ A batch seals once it has been open this long.
    #[serde(default = "default_interval_secs", alias = "buffer_interval_secs")]
    pub interval_secs: u64,
    /// 🪣 Ingest refuses records beyond this many buffered-but-unfinished bytes.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
    /// ⌛ Per sink/backup call. Separate from the retry budget.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 🧵 Concurrent delivery workers.
    #[serde(default = "default_sink_parallelism", alias = "num_sink_workers")]
    pub sink_parallelism: usize,
    /// 🔁 First retry delay; doubles per attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 🧢 Retry delays never exceed this.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_retry_duration_secs() -> u64 {
    300
}
fn default_size_threshold_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_interval_secs() -> u64 {
    60
}
fn default_max_buffered_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_sink_parallelism() -> usize {
    1
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_secs() -> u64 {
    30
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_duration_secs: default_retry_duration_secs(),
            size_threshold_bytes: default_size_threshold_bytes(),
            interval_secs: default_interval_secs(),
            max_buffered_bytes: default_max_buffered_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
            sink_parallelism: default_sink_parallelism(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_duration(&self) -> Duration {
        Duration::from_secs(self.retry_duration_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// 📬 Batch consumer knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    /// 1..=10, like the queues this was built for.
    #[serde(default = "default_max_records_per_poll")]
    pub max_records_per_poll: usize,
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,
    /// 🧢 Cap for the backoff after a failed poll or a full pipeline.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_max_records_per_poll() -> usize {
    MAX_RECORDS_PER_POLL
}
fn default_poll_wait_secs() -> u64 {
    20
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_records_per_poll: default_max_records_per_poll(),
            poll_wait_secs: default_poll_wait_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// 🧹 A subscription filter policy and where to register it.
#[derive(Debug, Deserialize, Clone)]
pub struct FilterPolicyConfig {
    pub subscription: String,
    /// 📒 JSON registry file mapping subscription → policy.
    pub registry: PathBuf,
    /// 📜 Attribute name → allowed values / conditions.
    pub policy: serde_json::Value,
}

impl AppConfig {
    /// 🚦 The checks serde can't express. Returns the first complaint, loudly.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.retry_duration_secs > MAX_RETRY_DURATION_SECS {
            bail!(
                "💀 pipeline.retry_duration_secs = {} is outside 0..={}. Nobody retries for that long and stays happy.",
                p.retry_duration_secs,
                MAX_RETRY_DURATION_SECS
            );
        }
        if p.size_threshold_bytes == 0 {
            bail!("💀 pipeline.size_threshold_bytes must be positive. A zero-byte batch is a philosophical stance, not a batch.");
        }
        if p.interval_secs == 0 {
            bail!("💀 pipeline.interval_secs must be positive");
        }
        if p.max_buffered_bytes < p.size_threshold_bytes {
            bail!(
                "💀 pipeline.max_buffered_bytes ({}) is smaller than size_threshold_bytes ({}). A batch could never fill up.",
                p.max_buffered_bytes,
                p.size_threshold_bytes
            );
        }
        if p.request_timeout_secs == 0 {
            bail!("💀 pipeline.request_timeout_secs must be positive");
        }
        if p.sink_parallelism == 0 {
            bail!("💀 pipeline.sink_parallelism must be at least 1. Zero workers deliver zero batches.");
        }
        if p.initial_backoff_ms == 0 || p.max_backoff_secs == 0 {
            bail!("💀 pipeline backoff settings must be positive");
        }
        let c = &self.consumer;
        if !(1..=MAX_RECORDS_PER_POLL).contains(&c.max_records_per_poll) {
            bail!(
                "💀 consumer.max_records_per_poll = {} is outside 1..={}",
                c.max_records_per_poll,
                MAX_RECORDS_PER_POLL
            );
        }
        if c.max_backoff_secs == 0 {
            bail!("💀 consumer.max_backoff_secs must be positive");
        }
        if let Some(filter) = &self.filter_policy {
            crate::filter_policy::FilterPolicy::parse(filter.policy.clone())
                .with_context(|| format!("💀 filter_policy for '{}' is not a valid policy", filter.subscription))?;
        }
        Ok(())
    }

    /// 🗺️ Human-readable wiring, one `(what, where)` row per component.
    /// The CLI prints it at startup so operators can see where things go.
    pub fn describe_wiring(&self) -> Vec<(String, String)> {
        let queue = match &self.queue_config {
            QueueConfig::InMemory => "in-memory".to_string(),
            QueueConfig::Spool(cfg) => format!("spool dir {}", cfg.directory.display()),
        };
        let sink = match &self.sink_config {
            SinkConfig::InMemory => "in-memory".to_string(),
            SinkConfig::File(cfg) => format!("file {}", cfg.file_name.display()),
            SinkConfig::Elasticsearch(cfg) => format!(
                "{}/{} (rotation {:?}{})",
                cfg.url.trim_end_matches('/'),
                cfg.index,
                cfg.index_rotation,
                if cfg.type_name.is_empty() { String::new() } else { format!(", type {}", cfg.type_name) }
            ),
        };
        let backup = match &self.backup_config.store {
            BackupStoreConfig::InMemory => format!("in-memory, prefix '{}'", self.backup_config.prefix),
            BackupStoreConfig::Directory(cfg) => {
                format!("{}/{}", cfg.directory.display(), self.backup_config.prefix)
            }
        };
        vec![
            ("📬 queue".to_string(), queue),
            ("🕳️ sink".to_string(), sink),
            ("🧯 backup".to_string(), backup),
            ("🗜️ compression".to_string(), format!("{:?}", self.backup_config.compression)),
            (
                "⏳ retry budget".to_string(),
                format!("{}s", self.pipeline.retry_duration_secs),
            ),
            (
                "📦 seal at".to_string(),
                format!(
                    "{} bytes or {}s",
                    self.pipeline.size_threshold_bytes, self.pipeline.interval_secs
                ),
            ),
        ]
    }
}

/// 🚀 Load the config: from a file, from env vars, or from the sheer power of hoping.
///
/// - `config_file_name` is None → `SPW_*` env vars only.
/// - `config_file_name` is Some → env vars + TOML file, merged. TOML wins on conflicts.
///
/// Nested keys in env vars use a double underscore: `SPW_PIPELINE__RETRY_DURATION_SECS=60`.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("SPW_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (SPW_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (SPW_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config.validate()?;
    Ok(app_config)
}
