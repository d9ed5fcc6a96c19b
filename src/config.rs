//! TOML configuration with environment overrides.
//!
//! Every section but `[db]` is optional and every field but `db.path` has a
//! default. After parsing, the deployment variables `CHUNK_SIZE_PAGES`,
//! `CHUNK_CONCURRENCY`, `CHUNK_RETENTION_DAYS` and
//! `STUCK_JOB_THRESHOLD_MINUTES` override the file, and the result is
//! validated.
//!
//! ```toml
//! [db]
//! path = "./data/casechunk.sqlite"
//!
//! [storage]
//! backend = "fs"            # or "s3"
//! root = "./data/objects"
//!
//! [ocr]
//! provider = "http"
//! endpoint = "https://ocr.internal/v1/process"
//! api_key_env = "OCR_API_KEY"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use casechunk_core::retry::RetryPolicy;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Root directory for the `fs` backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom S3-compatible endpoint (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_storage_root(),
            bucket: default_bucket(),
            region: None,
            endpoint_url: None,
        }
    }
}

fn default_backend() -> String {
    "fs".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_bucket() -> String {
    "casechunk".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts per chunk, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            api_key_env: None,
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl OcrConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_concurrency() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    90
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    2000
}
fn default_backoff_max_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_pages_per_chunk")]
    pub pages_per_chunk: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            pages_per_chunk: default_pages_per_chunk(),
        }
    }
}

fn default_pages_per_chunk() -> u32 {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub days: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn window_secs(&self) -> i64 {
        i64::from(self.days) * 86_400
    }
}

fn default_retention_days() -> u32 {
    7
}
fn default_sweep_interval_secs() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_threshold_minutes")]
    pub threshold_minutes: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub auto_reset: bool,
    /// How often every `ocr_complete` document is re-validated.
    #[serde(default = "default_integrity_interval_secs")]
    pub integrity_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: default_threshold_minutes(),
            poll_interval_secs: default_poll_interval_secs(),
            auto_reset: false,
            integrity_interval_secs: default_integrity_interval_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn threshold_secs(&self) -> i64 {
        i64::from(self.threshold_minutes) * 60
    }
}

fn default_threshold_minutes() -> u32 {
    5
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_integrity_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}

impl Config {
    /// Defaults everywhere, database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            storage: StorageConfig::default(),
            ocr: OcrConfig::default(),
            chunking: ChunkingConfig::default(),
            retention: RetentionConfig::default(),
            monitor: MonitorConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Apply deployment overrides from `lookup` (normally the process environment).
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
        raw.trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, raw))
    }

    if let Some(raw) = lookup("CHUNK_SIZE_PAGES") {
        config.chunking.pages_per_chunk = parse("CHUNK_SIZE_PAGES", &raw)?;
    }
    if let Some(raw) = lookup("CHUNK_CONCURRENCY") {
        config.ocr.concurrency = parse("CHUNK_CONCURRENCY", &raw)?;
    }
    if let Some(raw) = lookup("CHUNK_RETENTION_DAYS") {
        config.retention.days = parse("CHUNK_RETENTION_DAYS", &raw)?;
    }
    if let Some(raw) = lookup("STUCK_JOB_THRESHOLD_MINUTES") {
        config.monitor.threshold_minutes = parse("STUCK_JOB_THRESHOLD_MINUTES", &raw)?;
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.pages_per_chunk == 0 {
        bail!("chunking.pages_per_chunk must be > 0");
    }
    if config.ocr.concurrency == 0 {
        bail!("ocr.concurrency must be > 0");
    }
    if config.ocr.max_attempts == 0 {
        bail!("ocr.max_attempts must be >= 1");
    }
    if config.ocr.timeout_secs == 0 {
        bail!("ocr.timeout_secs must be > 0");
    }
    if config.monitor.threshold_minutes == 0 {
        bail!("monitor.threshold_minutes must be > 0");
    }
    if config.retention.sweep_interval_secs == 0
        || config.monitor.poll_interval_secs == 0
        || config.monitor.integrity_interval_secs == 0
    {
        bail!("timer intervals must be > 0");
    }

    match config.ocr.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.ocr.endpoint.is_none() {
                bail!("ocr.endpoint must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown OCR provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    match config.storage.backend.as_str() {
        "fs" => {}
        "s3" => {
            if config.storage.bucket.trim().is_empty() {
                bail!("storage.bucket must be specified for the s3 backend");
            }
            if config.storage.region.is_none() {
                bail!("storage.region must be specified for the s3 backend");
            }
        }
        other => bail!(
            "Unknown storage backend: '{}'. Must be fs or s3.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg = parse("[db]\npath = \"./data/x.sqlite\"\n");
        assert_eq!(cfg.chunking.pages_per_chunk, 25);
        assert_eq!(cfg.ocr.concurrency, 5);
        assert_eq!(cfg.ocr.timeout_secs, 90);
        assert_eq!(cfg.retention.days, 7);
        assert_eq!(cfg.monitor.threshold_minutes, 5);
        assert!(!cfg.monitor.auto_reset);
        assert_eq!(cfg.monitor.integrity_interval_secs, 3600);
        assert_eq!(cfg.storage.backend, "fs");
        validate(&cfg).unwrap();
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let mut cfg = parse(
            "[db]\npath = \"x\"\n[chunking]\npages_per_chunk = 10\n[ocr]\nconcurrency = 2\n",
        );
        let env: HashMap<&str, &str> = [
            ("CHUNK_SIZE_PAGES", "40"),
            ("CHUNK_CONCURRENCY", "8"),
            ("CHUNK_RETENTION_DAYS", "14"),
            ("STUCK_JOB_THRESHOLD_MINUTES", "12"),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.chunking.pages_per_chunk, 40);
        assert_eq!(cfg.ocr.concurrency, 8);
        assert_eq!(cfg.retention.days, 14);
        assert_eq!(cfg.monitor.threshold_minutes, 12);
    }

    #[test]
    fn bad_override_is_an_error() {
        let mut cfg = Config::with_db_path("x");
        let err = apply_env_overrides(&mut cfg, |k| {
            (k == "CHUNK_CONCURRENCY").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("CHUNK_CONCURRENCY"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = Config::with_db_path("x");
        cfg.chunking.pages_per_chunk = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = Config::with_db_path("x");
        cfg.ocr.provider = "http".into();
        assert!(validate(&cfg).is_err());

        let mut cfg = Config::with_db_path("x");
        cfg.storage.backend = "s3".into();
        assert!(validate(&cfg).is_err());
        cfg.storage.region = Some("us-east-1".into());
        validate(&cfg).unwrap();
    }
}
