//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (blockhaus.toml, optional)
//! 3. Environment variables (BLOCKHAUS__*, override)
//!
//! CLI flags are merged on top by the binary after loading. The target-list
//! loader also lives here; the cookie jar has its own loader in
//! `api::session` because it participates in session recovery.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::data::TargetList;
use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub run: RunConfig,
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub throttle: ThrottleConfig,
    pub logging: LoggingConfig,
}

/// Input and state file locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Cookie jar file (browser export JSON)
    pub cookies: PathBuf,
    /// Target-list file
    pub targets: PathBuf,
    /// Outcome history database
    pub database: PathBuf,
    /// Cache directory root
    pub cache_dir: PathBuf,
}

/// Pipeline control parameters
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Targets per prefilter/resolve batch
    pub batch_size: usize,
    /// Inter-call delay in seconds
    pub delay_secs: f64,
    /// Attempt ceiling for interactive runs
    pub retry_ceiling: i64,
    /// Attempt ceiling for the auto-retry pass
    pub auto_retry_ceiling: i64,
    /// Targets processed when neither --all nor an explicit limit is given
    pub test_mode_limit: usize,
}

/// Upstream API knobs
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Upstream origin; overridden in tests
    pub base_url: String,
    /// Per-request transaction-id header generation
    pub enable_header_enhancement: bool,
    /// Regional forwarding header (experimental)
    pub enable_forwarded_for: bool,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Cache tier TTLs and size ceilings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Lookup tier TTL in seconds (handle -> id; long-lived)
    pub lookup_ttl_secs: u64,
    /// Profile tier TTL in seconds
    pub profile_ttl_secs: u64,
    /// Relationship tier TTL in seconds
    pub relationship_ttl_secs: u64,
    /// Profile tier entry ceiling
    pub profile_max_entries: usize,
    /// Relationship tier entry ceiling
    pub relationship_max_entries: usize,
}

/// Empty-body-403 circuit tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Consecutive empty-body 403s that trip the circuit
    pub consecutive_403s: u32,
    /// Window the streak must fall within, in seconds
    pub window_secs: u64,
    /// Cool-down once tripped, in seconds
    pub cooldown_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from defaults, optional file, and environment.
    pub fn load() -> Result<Self> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("paths.cookies", "cookies.json")?
            .set_default("paths.targets", "targets.json")?
            .set_default("paths.database", "block_history.db")?
            .set_default("paths.cache_dir", "cache")?
            .set_default("run.batch_size", 50)?
            .set_default("run.delay_secs", 1.0)?
            .set_default("run.retry_ceiling", 3)?
            .set_default("run.auto_retry_ceiling", 10)?
            .set_default("run.test_mode_limit", 5)?
            .set_default("api.base_url", "https://x.com")?
            .set_default("api.enable_header_enhancement", true)?
            .set_default("api.enable_forwarded_for", false)?
            .set_default("api.timeout_secs", 30)?
            .set_default("cache.lookup_ttl_secs", 86_400)?
            .set_default("cache.profile_ttl_secs", 3_600)?
            .set_default("cache.relationship_ttl_secs", 1_800)?
            .set_default("cache.profile_max_entries", 1_000)?
            .set_default("cache.relationship_max_entries", 500)?
            .set_default("throttle.consecutive_403s", 5)?
            .set_default("throttle.window_secs", 300)?
            .set_default("throttle.cooldown_secs", 1_800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("blockhaus").required(false))
            .add_source(
                Environment::with_prefix("BLOCKHAUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<()> {
        if self.run.batch_size == 0 {
            return Err(AppError::Config(
                "run.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.run.delay_secs < 0.0 {
            return Err(AppError::Config(
                "run.delay_secs must not be negative".to_string(),
            ));
        }

        if self.run.retry_ceiling < 1 || self.run.auto_retry_ceiling < self.run.retry_ceiling {
            return Err(AppError::Config(
                "run.retry_ceiling must be >= 1 and <= run.auto_retry_ceiling".to_string(),
            ));
        }

        if self.throttle.consecutive_403s == 0 {
            return Err(AppError::Config(
                "throttle.consecutive_403s must be greater than 0".to_string(),
            ));
        }

        if url::Url::parse(&self.api.base_url).is_err() {
            return Err(AppError::Config(format!(
                "api.base_url is not a valid URL: {}",
                self.api.base_url
            )));
        }

        Ok(())
    }
}

/// Load and validate the target-list file.
///
/// The file is a single JSON record `{"format": "screen_name"|"user_id",
/// "users": [...]}`. Unknown format values and empty lists are hard
/// configuration errors.
pub fn load_target_list(path: &Path) -> Result<TargetList> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!(
            "cannot read target list {}: {}",
            path.display(),
            e
        ))
    })?;

    let list: TargetList = serde_json::from_str(&raw).map_err(|e| {
        AppError::Config(format!(
            "invalid target list {} (expected {{\"format\": \"screen_name\"|\"user_id\", \"users\": [...]}}): {}",
            path.display(),
            e
        ))
    })?;

    if list.users.is_empty() {
        return Err(AppError::Config(format!(
            "target list {} contains no users",
            path.display()
        )));
    }

    Ok(list)
}
