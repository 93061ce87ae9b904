use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the flamestore service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tiered store backend and retention.
    #[serde(default)]
    pub store: StoreConfig,

    /// Artifact queue, blob access and decoding.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Batched writer tuning.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Flame graph read API.
    #[serde(default)]
    pub query: QueryConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    /// In-process maps. Data does not survive restarts.
    #[default]
    Memory,
    /// ClickHouse native protocol.
    Clickhouse,
}

/// Tiered store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend type (memory, clickhouse). Default: memory.
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// ClickHouse connection, used when backend is clickhouse.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Per-tier retention windows.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// How often expired buckets are evicted. Default: 10m.
    #[serde(default = "default_eviction_interval", with = "humantime_serde")]
    pub eviction_interval: Duration,
}

/// Retention window per tier, measured from now.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetentionConfig {
    /// Raw rows. Default: 24h.
    #[serde(default = "default_raw_retention", with = "humantime_serde")]
    pub raw: Duration,

    /// Root-only per-minute totals. Default: 7d.
    #[serde(default = "default_minute_retention", with = "humantime_serde")]
    pub minute: Duration,

    /// Hourly tiers (by-host and all-hosts). Default: 14d.
    #[serde(default = "default_hourly_retention", with = "humantime_serde")]
    pub hourly: Duration,

    /// Daily tiers (by-host and all-hosts). Default: 365d.
    #[serde(default = "default_daily_retention", with = "humantime_serde")]
    pub daily: Duration,

    /// Per-artifact metric records. Default: 14d.
    #[serde(default = "default_metrics_retention", with = "humantime_serde")]
    pub metrics: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Upper bound on pooled connections. Default: 8.
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Upstream message queue.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Delay between empty queue polls. Default: 1s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum messages taken per receive call. Default: 10.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Artifacts processed concurrently. Default: 4.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Artifact and side-blob storage.
    #[serde(default)]
    pub blobs: BlobsConfig,

    /// Frame name rewrite rules.
    #[serde(default)]
    pub normalization: NormalizationConfig,

    /// Root frame names treated as idle. Default: ["swapper"].
    #[serde(default = "default_idle_frames")]
    pub idle_frames: Vec<String>,
}

/// Spool directory queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Directory holding `*.json` message files.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

/// Blob storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackendKind {
    /// Local directory.
    #[default]
    Fs,
    /// HTTP object gateway (GET/PUT by key).
    Http,
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobsConfig {
    /// Backend type (fs, http). Default: fs.
    #[serde(default)]
    pub backend: BlobBackendKind,

    /// Root directory for the fs backend.
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,

    /// Base URL for the http backend.
    #[serde(default)]
    pub endpoint: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-request timeout for the http backend. Default: 30s.
    #[serde(default = "default_blob_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// One regex rewrite applied to frame names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

/// Frame name normalization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizationConfig {
    /// Inline rules, applied before file rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Optional YAML file with a `rules` list, watched for changes.
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// How often the rules file is checked. Default: 30s.
    #[serde(default = "default_reload_interval", with = "humantime_serde")]
    pub reload_interval: Duration,
}

/// Batched writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Bounded queue capacity per record kind. Default: 65536.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Rows per flush. Default: 10000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between flushes. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Retries per failed flush step before the writer gives up. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retries, doubled per attempt. Default: 500ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

/// Query API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_query_addr")]
    pub addr: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_raw_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_minute_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_hourly_retention() -> Duration {
    Duration::from_secs(14 * 24 * 60 * 60)
}

fn default_daily_retention() -> Duration {
    Duration::from_secs(365 * 24 * 60 * 60)
}

fn default_metrics_retention() -> Duration {
    Duration::from_secs(14 * 24 * 60 * 60)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_messages() -> usize {
    10
}

fn default_workers() -> usize {
    4
}

fn default_pool_max() -> usize {
    8
}

fn default_idle_frames() -> Vec<String> {
    vec!["swapper".to_string()]
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/lib/flamestore/queue")
}

fn default_blob_root() -> PathBuf {
    PathBuf::from("/var/lib/flamestore/blobs")
}

fn default_blob_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_queue_capacity() -> usize {
    65536
}

fn default_batch_size() -> usize {
    10000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_query_addr() -> String {
    ":8080".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: StoreConfig::default(),
            ingest: IngestConfig::default(),
            writer: WriterConfig::default(),
            query: QueryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            clickhouse: ClickHouseConfig::default(),
            retention: RetentionConfig::default(),
            eviction_interval: default_eviction_interval(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw: default_raw_retention(),
            minute: default_minute_retention(),
            hourly: default_hourly_retention(),
            daily: default_daily_retention(),
            metrics: default_metrics_retention(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            pool_max: default_pool_max(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            poll_interval: default_poll_interval(),
            max_messages: default_max_messages(),
            workers: default_workers(),
            blobs: BlobsConfig::default(),
            normalization: NormalizationConfig::default(),
            idle_frames: default_idle_frames(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
        }
    }
}

impl Default for BlobsConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackendKind::default(),
            root: default_blob_root(),
            endpoint: String::new(),
            headers: HashMap::new(),
            timeout: default_blob_timeout(),
        }
    }
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            rules_path: None,
            reload_interval: default_reload_interval(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            addr: default_query_addr(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackendKind::Clickhouse
            && self.store.clickhouse.endpoint.is_empty()
        {
            bail!("store.clickhouse.endpoint is required when store.backend is clickhouse");
        }

        if self.store.clickhouse.pool_max == 0 {
            bail!("store.clickhouse.pool_max must be positive");
        }

        let retention = &self.store.retention;
        for (name, window) in [
            ("raw", retention.raw),
            ("minute", retention.minute),
            ("hourly", retention.hourly),
            ("daily", retention.daily),
            ("metrics", retention.metrics),
        ] {
            if window.is_zero() {
                bail!("store.retention.{name} must be positive");
            }
        }
        if retention.hourly <= retention.raw {
            bail!(
                "store.retention.hourly ({:?}) must be longer than store.retention.raw ({:?})",
                retention.hourly,
                retention.raw
            );
        }
        if retention.daily <= retention.hourly {
            bail!(
                "store.retention.daily ({:?}) must be longer than store.retention.hourly ({:?})",
                retention.daily,
                retention.hourly
            );
        }
        if self.store.eviction_interval.is_zero() {
            bail!("store.eviction_interval must be positive");
        }

        if self.ingest.workers == 0 {
            bail!("ingest.workers must be positive");
        }
        if self.ingest.max_messages == 0 {
            bail!("ingest.max_messages must be positive");
        }
        if self.ingest.poll_interval.is_zero() {
            bail!("ingest.poll_interval must be positive");
        }
        if self.ingest.blobs.backend == BlobBackendKind::Http
            && self.ingest.blobs.endpoint.is_empty()
        {
            bail!("ingest.blobs.endpoint is required when ingest.blobs.backend is http");
        }
        if self.ingest.normalization.rules_path.is_some()
            && self.ingest.normalization.reload_interval.is_zero()
        {
            bail!("ingest.normalization.reload_interval must be positive");
        }
        if self.ingest.idle_frames.iter().any(String::is_empty) {
            bail!("ingest.idle_frames must not contain empty names");
        }

        if self.writer.queue_capacity == 0 {
            bail!("writer.queue_capacity must be positive");
        }
        if self.writer.batch_size == 0 {
            bail!("writer.batch_size must be positive");
        }
        if self.writer.flush_interval.is_zero() {
            bail!("writer.flush_interval must be positive");
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand into a bindable address.
pub fn bind_addr(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
