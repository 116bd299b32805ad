use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::Level;
use vaultline_execution::{
    BackoffPolicy, CachedSettings, Clock, Economy, EconomyError, EconomySettings, RetryPolicy,
    SettingsSnapshot, StoreConfig,
};
use vaultline_types::{MultiplierWindow, Reward, TypesError, ValuationTable};

pub mod defaults;
pub mod simulate;

/// Output format for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Delay schedule between draw retries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Economy configuration as read from YAML.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub database_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
    #[serde(default = "default_draw_max_attempts")]
    pub draw_max_attempts: u32,
    #[serde(default)]
    pub draw_backoff: BackoffKind,
    #[serde(default = "default_draw_backoff_base_ms")]
    pub draw_backoff_base_ms: u64,
    #[serde(default = "default_draw_backoff_max_ms")]
    pub draw_backoff_max_ms: u64,
    #[serde(default = "default_draw_backoff_jitter")]
    pub draw_backoff_jitter: bool,

    #[serde(flatten)]
    pub settings: SettingsConfig,
    /// How long earn settings are served from cache; 0 re-reads the file on
    /// every call.
    #[serde(default = "default_config_cache_ttl_ms")]
    pub config_cache_ttl_ms: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// The part of [`Config`] re-read on every earn call.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SettingsConfig {
    #[serde(default)]
    pub vault_locked_ttl_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<MultiplierWindow>,
    /// `"KIND:AMOUNT" -> points`, e.g. `DIAMOND:5: 500` or `ITEM:MUG:1: 120`.
    #[serde(default)]
    pub valuations: BTreeMap<String, u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("database_path must not be empty")]
    EmptyDatabasePath,
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("draw_backoff_base_ms ({base_ms}) must not exceed draw_backoff_max_ms ({max_ms})")]
    BackoffRange { base_ms: u64, max_ms: u64 },
    #[error("invalid multiplier window: {0}")]
    InvalidMultiplier(#[source] TypesError),
    #[error("invalid valuation key {key}: expected KIND:AMOUNT")]
    InvalidValuationKey { key: String },
}

pub struct ValidatedConfig {
    pub database_path: PathBuf,
    pub log_level: Level,
    pub log_format: LogFormat,
    pub store: StoreConfig,
    pub retry: RetryPolicy,
    pub settings: SettingsSnapshot,
    pub config_cache_ttl: Duration,
    pub worker_threads: usize,
}

fn default_log_level() -> String {
    defaults::DEFAULT_LOG_LEVEL.to_string()
}

fn default_lock_timeout_ms() -> u64 {
    defaults::DEFAULT_LOCK_TIMEOUT_MS
}

fn default_max_idle_connections() -> usize {
    defaults::DEFAULT_MAX_IDLE_CONNECTIONS
}

fn default_draw_max_attempts() -> u32 {
    defaults::DEFAULT_DRAW_MAX_ATTEMPTS
}

fn default_draw_backoff_base_ms() -> u64 {
    defaults::DEFAULT_DRAW_BACKOFF_BASE_MS
}

fn default_draw_backoff_max_ms() -> u64 {
    defaults::DEFAULT_DRAW_BACKOFF_MAX_MS
}

fn default_draw_backoff_jitter() -> bool {
    defaults::DEFAULT_DRAW_BACKOFF_JITTER
}

fn default_config_cache_ttl_ms() -> u64 {
    defaults::DEFAULT_CONFIG_CACHE_TTL_MS
}

fn default_worker_threads() -> usize {
    defaults::DEFAULT_WORKER_THREADS
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

/// Split `KIND:AMOUNT` at the last colon and check that it names a reward.
fn parse_valuation_key(key: &str) -> Result<Reward, ConfigError> {
    let invalid = || ConfigError::InvalidValuationKey {
        key: key.to_string(),
    };
    let (kind, amount) = key.rsplit_once(':').ok_or_else(invalid)?;
    let amount = amount.parse::<u64>().map_err(|_| invalid())?;
    Reward::from_descriptor(kind, amount).map_err(|_| invalid())
}

impl SettingsConfig {
    pub fn validate(&self) -> Result<SettingsSnapshot, ConfigError> {
        if let Some(window) = &self.multiplier {
            window.validate().map_err(ConfigError::InvalidMultiplier)?;
        }
        if let Some(ttl) = self.vault_locked_ttl_ms {
            ensure_nonzero("vault_locked_ttl_ms", ttl)?;
        }
        let mut valuations = ValuationTable::default();
        for (key, points) in &self.valuations {
            let reward = parse_valuation_key(key)?;
            // Store under the canonical key so lookups match `Reward::valuation_key`.
            let canonical = reward.valuation_key().ok_or_else(|| ConfigError::InvalidValuationKey {
                key: key.clone(),
            })?;
            valuations.insert(canonical, *points);
        }
        Ok(SettingsSnapshot {
            multiplier: self.multiplier,
            valuations,
            locked_ttl_ms: self.vault_locked_ttl_ms,
        })
    }
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        ensure_nonzero("lock_timeout_ms", self.lock_timeout_ms)?;
        ensure_nonzero("draw_max_attempts", u64::from(self.draw_max_attempts))?;
        ensure_nonzero("worker_threads", self.worker_threads as u64)?;
        if self.draw_backoff_base_ms > self.draw_backoff_max_ms {
            return Err(ConfigError::BackoffRange {
                base_ms: self.draw_backoff_base_ms,
                max_ms: self.draw_backoff_max_ms,
            });
        }
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;
        let settings = self.settings.validate()?;

        let base = Duration::from_millis(self.draw_backoff_base_ms);
        let backoff = match self.draw_backoff {
            BackoffKind::Fixed => BackoffPolicy::Fixed(base),
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                base,
                max: Duration::from_millis(self.draw_backoff_max_ms),
            },
        };

        Ok(ValidatedConfig {
            database_path: PathBuf::from(self.database_path),
            log_level,
            log_format: self.log_format,
            store: StoreConfig {
                lock_timeout: Duration::from_millis(self.lock_timeout_ms),
                max_idle_connections: self.max_idle_connections,
            },
            retry: RetryPolicy {
                max_attempts: self.draw_max_attempts,
                backoff,
                jitter: self.draw_backoff_jitter,
            },
            settings,
            config_cache_ttl: Duration::from_millis(self.config_cache_ttl_ms),
            worker_threads: self.worker_threads,
        })
    }
}

/// Earn settings read from the config file on every snapshot.
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EconomySettings for FileSettings {
    fn snapshot(&self) -> Result<SettingsSnapshot, EconomyError> {
        let contents = fs::read_to_string(&self.path).map_err(|err| {
            EconomyError::InvalidConfig(format!("read {}: {err}", self.path.display()))
        })?;
        let config = Config::from_yaml(&contents)
            .map_err(|err| EconomyError::InvalidConfig(err.to_string()))?;
        config
            .settings
            .validate()
            .map_err(|err| EconomyError::InvalidConfig(err.to_string()))
    }
}

impl ValidatedConfig {
    /// Open the economy with earn settings served from `config_path`.
    pub fn open_economy(
        &self,
        config_path: &Path,
        clock: Arc<dyn Clock>,
    ) -> Result<Economy, EconomyError> {
        let source = FileSettings::new(config_path);
        let settings: Arc<dyn EconomySettings> = if self.config_cache_ttl.is_zero() {
            Arc::new(source)
        } else {
            Arc::new(CachedSettings::new(
                source,
                self.config_cache_ttl,
                clock.clone(),
            ))
        };
        Economy::open(
            &self.database_path,
            self.store.clone(),
            clock,
            settings,
            self.retry,
        )
    }
}
