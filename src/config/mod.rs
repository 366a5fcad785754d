//! Configuration management for vct-ingest
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use crate::models::TargetKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable overriding the database location
pub const DB_PATH_ENV: &str = "VCT_INGEST_DB";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling and re-scrape cadence
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Page fetching
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Identity resolution and merge policy
    #[serde(default)]
    pub normalize: NormalizeConfig,

    /// Configured sources
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum targets per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between batch emissions (milliseconds)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Re-fetch interval for live matches
    #[serde(default = "default_live_refresh_secs")]
    pub live_refresh_secs: u64,

    /// Delay before the finalization re-fetch of a completed match
    #[serde(default = "default_finalize_after_secs")]
    pub finalize_after_secs: u64,

    /// Age after which finalized entities are re-checked
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Re-fetch interval for match listing pages
    #[serde(default = "default_listing_refresh_secs")]
    pub listing_refresh_secs: u64,

    /// Half-life of the age-based priority bonus (hours)
    #[serde(default = "default_decay_half_life_hours")]
    pub decay_half_life_hours: f64,
}

/// Fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-attempt timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Immediate retries for timeouts and navigation failures
    #[serde(default = "default_fetch_max_retries")]
    pub max_retries: u32,

    /// Pause between immediate retries (milliseconds)
    #[serde(default = "default_fetch_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// User agent string
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Use the headless browser instead of plain HTTP
    #[serde(default = "default_js_rendering")]
    pub js_rendering: bool,

    /// Time to wait after navigation for dynamic content (milliseconds)
    #[serde(default = "default_render_wait_ms")]
    pub render_wait_ms: u64,

    /// Disable browser sandbox (required in some Docker/CI environments)
    #[serde(default)]
    pub js_no_sandbox: bool,
}

/// Normalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Sources in descending authority, used to merge conflicting candidates
    #[serde(default = "default_source_priority")]
    pub source_priority: Vec<String>,

    /// Retries before an unresolved record becomes an orphan
    #[serde(default = "default_max_unresolved_attempts")]
    pub max_unresolved_attempts: u32,

    /// Minimum seconds between two counted retries of one unresolved record
    #[serde(default = "default_unresolved_retry_interval_secs")]
    pub unresolved_retry_interval_secs: u64,
}

/// A configured external origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable source identifier (e.g. "vlr")
    pub id: String,

    /// Base URL substituted for `{base}` in the patterns
    pub base_url: String,

    /// URL patterns per target kind
    pub urls: UrlPatterns,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: RateLimitPolicy,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: BackoffPolicy,

    /// Alias table, relative to the config directory
    #[serde(default)]
    pub alias_table: Option<PathBuf>,

    /// Concurrent fetch workers
    #[serde(default = "default_source_concurrency")]
    pub concurrency: usize,
}

/// URL patterns with `{base}` and `{ref}` placeholders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlPatterns {
    pub match_list: String,
    pub match_page: String,
    pub team: String,
    pub player: String,
}

/// Token bucket admission: `requests` per `interval_secs`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub requests: u32,
    pub interval_secs: u64,
}

/// Longest backoff or pause a source may be configured for (one week)
pub const MAX_BACKOFF_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Exponential backoff applied per source after failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl BackoffPolicy {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Next delay after a failure, capped at the configured maximum
    pub fn next(&self, current: Option<Duration>) -> Duration {
        let next = match current {
            None => self.initial(),
            Some(d) => Duration::try_from_secs_f64(d.as_secs_f64() * self.multiplier.max(1.0))
                .unwrap_or_else(|_| self.max()),
        };
        next.min(self.max())
    }
}

impl SourceConfig {
    /// Build the page URL for a target
    pub fn url_for(&self, kind: TargetKind, external_ref: &str) -> String {
        let pattern = match kind {
            TargetKind::MatchList => &self.urls.match_list,
            TargetKind::Match => &self.urls.match_page,
            TargetKind::Team => &self.urls.team,
            TargetKind::Player => &self.urls.player,
        };
        pattern
            .replace("{base}", self.base_url.trim_end_matches('/'))
            .replace("{ref}", external_ref)
    }
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for vct-ingest data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,

    /// Directory for raw page snapshots
    pub snapshot_dir: PathBuf,

    /// Scheduler status report written by `run`
    pub status_file: PathBuf,
}

impl PathsConfig {
    fn under(base: &Path, config_file: PathBuf) -> Self {
        let db_file = std::env::var(DB_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("vct_data.db"));
        Self {
            config_file,
            db_file,
            snapshot_dir: base.join("snapshots"),
            status_file: base.join("status.json"),
            base_dir: base.to_path_buf(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            fetch: FetchConfig::default(),
            normalize: NormalizeConfig::default(),
            sources: default_sources(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            tick_ms: default_tick_ms(),
            live_refresh_secs: default_live_refresh_secs(),
            finalize_after_secs: default_finalize_after_secs(),
            stale_after_secs: default_stale_after_secs(),
            listing_refresh_secs: default_listing_refresh_secs(),
            decay_half_life_hours: default_decay_half_life_hours(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_retries: default_fetch_max_retries(),
            retry_delay_ms: default_fetch_retry_delay_ms(),
            user_agent: default_user_agent(),
            js_rendering: default_js_rendering(),
            render_wait_ms: default_render_wait_ms(),
            js_no_sandbox: false,
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            source_priority: default_source_priority(),
            max_unresolved_attempts: default_max_unresolved_attempts(),
            unresolved_retry_interval_secs: default_unresolved_retry_interval_secs(),
        }
    }
}

impl Config {
    /// Get the default base directory (~/.vct-ingest)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vct-ingest")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig::under(&base, base.join("config.toml"));
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig::under(&base, config_path.to_path_buf());

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Look up a source by id
    pub fn source(&self, id: &str) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::UnknownSource(id.to_string()))
    }

    /// Resolve a source's alias table path against the config directory
    pub fn alias_table_path(&self, source: &SourceConfig) -> Option<PathBuf> {
        source.alias_table.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.paths.base_dir.join(p)
            }
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("at least one source is required".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(Error::Config(format!("duplicate source id '{}'", source.id)));
            }
            url::Url::parse(&source.base_url)?;
            if source.rate_limit.requests == 0 || source.rate_limit.interval_secs == 0 {
                return Err(Error::Config(format!(
                    "sources.{}.rate_limit must be positive",
                    source.id
                )));
            }
            let multiplier = source.retry_backoff.multiplier;
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(Error::Config(format!(
                    "sources.{}.retry_backoff.multiplier must be a finite number >= 1.0",
                    source.id
                )));
            }
            if source.retry_backoff.max_ms > MAX_BACKOFF_MS {
                return Err(Error::Config(format!(
                    "sources.{}.retry_backoff.max_ms must be <= {}",
                    source.id, MAX_BACKOFF_MS
                )));
            }
            if source.retry_backoff.initial_ms > source.retry_backoff.max_ms {
                return Err(Error::Config(format!(
                    "sources.{}.retry_backoff.initial_ms must be <= max_ms",
                    source.id
                )));
            }
            if source.concurrency == 0 {
                return Err(Error::Config(format!(
                    "sources.{}.concurrency must be at least 1",
                    source.id
                )));
            }
        }

        if self.scheduler.batch_size == 0 {
            return Err(Error::Config(
                "scheduler.batch_size must be at least 1".to_string(),
            ));
        }

        if self.scheduler.decay_half_life_hours <= 0.0 {
            return Err(Error::Config(
                "scheduler.decay_half_life_hours must be positive".to_string(),
            ));
        }

        if self.fetch.timeout_secs == 0 {
            return Err(Error::Config("fetch.timeout_secs must be positive".to_string()));
        }

        Ok(())
    }
}
