//! Configuration management for freshet.
//!
//! Settings come from an optional TOML file, overridden by environment
//! variables. Invalid configuration is fatal at startup; everything else
//! falls back to defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default database filename, created in the working directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "freshet.db";

/// Format key used when a payload matches no configured format.
pub const DEFAULT_FORMAT: &str = "default";

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Bearer token required by mutating API endpoints.
    pub api_token: String,
    /// Public base URL of this service, used to build absolute check URLs.
    pub api_base_url: String,
    /// Base URL of the upstream catalog webhook (None disables sending).
    pub webhook_url: Option<String>,
    pub crawl: CrawlSettings,
    pub schedule: ScheduleSettings,
    pub analysis: AnalysisSettings,
    pub queue: QueueSettings,
}

/// Prober pool and per-domain politeness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    /// Concurrent probe workers.
    pub pool_size: usize,
    /// Max in-flight probes against one domain.
    pub per_domain_concurrency: usize,
    /// Requests per second per domain (token bucket).
    pub per_domain_rate: f64,
    /// Total deadline for one probe, in seconds.
    pub timeout_secs: u64,
    /// TCP connect deadline, in seconds.
    pub connect_timeout_secs: u64,
    /// Sleep between scheduler passes when no work is eligible, in seconds.
    pub idle_sleep_secs: u64,
    pub user_agent: String,
}

/// Adaptive next-check dating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Base interval between checks, in seconds.
    pub base_interval_secs: u64,
    /// Floor for the adaptive interval, in seconds.
    pub min_interval_secs: u64,
    /// Ceiling for the adaptive interval, in seconds.
    pub max_interval_secs: u64,
    /// Retry interval after a failed probe, in seconds.
    pub failure_retry_secs: u64,
    /// Consecutive failures probed on the short lane before falling back.
    pub max_failure_retries: u32,
}

/// Download and tabular ingestion limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Concurrent analysis workers (disk- and CPU-bound).
    pub workers: usize,
    /// Hard download cap in bytes, keyed by inferred format.
    pub max_filesize_allowed: HashMap<String, u64>,
    /// Closed set of index kinds accepted in resource exceptions.
    pub sql_indexes_types_supported: Vec<String>,
    /// Rows scanned for column type inference.
    pub csv_lookahead_rows: usize,
    /// Prefix bytes parsed by the tabular sniff guard.
    pub csv_sniff_bytes: usize,
}

/// In-process work queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Seconds a delivered job may run before it is considered lost.
    pub visibility_secs: u64,
    /// Delivery attempts before a job is dropped.
    pub max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_FILENAME),
            api_token: String::new(),
            api_base_url: "http://localhost:8000".to_string(),
            webhook_url: None,
            crawl: CrawlSettings::default(),
            schedule: ScheduleSettings::default(),
            analysis: AnalysisSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            pool_size: 100,
            per_domain_concurrency: 5,
            per_domain_rate: 2.0,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            idle_sleep_secs: 1,
            user_agent: format!("freshet/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 7 * 24 * 3600,
            min_interval_secs: 3600,
            max_interval_secs: 30 * 24 * 3600,
            failure_retry_secs: 3600,
            max_failure_retries: 3,
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        let mut max_filesize_allowed = HashMap::new();
        max_filesize_allowed.insert("csv".to_string(), 104_857_600);
        max_filesize_allowed.insert(DEFAULT_FORMAT.to_string(), 104_857_600);
        Self {
            workers: 4,
            max_filesize_allowed,
            sql_indexes_types_supported: vec!["index".to_string(), "unique".to_string()],
            csv_lookahead_rows: 500,
            csv_sniff_bytes: 4096,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_secs: 300,
            max_attempts: 5,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file, then apply env overrides.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match config_path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("FRESHET_DATABASE") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(token) = std::env::var("FRESHET_API_TOKEN") {
            self.api_token = token;
        }
        if let Ok(base) = std::env::var("FRESHET_API_BASE_URL") {
            self.api_base_url = base;
        }
        if let Ok(url) = std::env::var("FRESHET_WEBHOOK_URL") {
            self.webhook_url = if url.is_empty() { None } else { Some(url) };
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.crawl.pool_size == 0 {
            anyhow::bail!("crawl.pool_size must be at least 1");
        }
        if self.crawl.per_domain_concurrency == 0 {
            anyhow::bail!("crawl.per_domain_concurrency must be at least 1");
        }
        if self.crawl.per_domain_rate <= 0.0 {
            anyhow::bail!("crawl.per_domain_rate must be positive");
        }
        if self.schedule.min_interval_secs > self.schedule.max_interval_secs {
            anyhow::bail!("schedule.min_interval_secs exceeds schedule.max_interval_secs");
        }
        if self.analysis.workers == 0 {
            anyhow::bail!("analysis.workers must be at least 1");
        }
        if !self
            .analysis
            .max_filesize_allowed
            .contains_key(DEFAULT_FORMAT)
        {
            anyhow::bail!("analysis.max_filesize_allowed must define a \"default\" entry");
        }
        Ok(())
    }

    /// Download cap for an inferred format, falling back to the default key.
    pub fn max_filesize_for(&self, format: &str) -> u64 {
        self.analysis
            .max_filesize_allowed
            .get(format)
            .or_else(|| self.analysis.max_filesize_allowed.get(DEFAULT_FORMAT))
            .copied()
            .unwrap_or(u64::MAX)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.crawl.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.crawl.connect_timeout_secs)
    }
}
