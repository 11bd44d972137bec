use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub stations: StationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between two ticks of the refresh scheduler.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on fetches running at the same time.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Deadline for a single station fetch, including the settle delay.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fixed pause after each page download, to pace requests to the
    /// provider. 0 disables it.
    #[serde(default)]
    pub settle_delay_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Samples kept per station; the oldest are dropped first.
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL diagram images are served from.
    #[serde(default = "default_provider_base")]
    pub base_url: String,
}

/// Stations registered at startup. Stations added at runtime are not
/// written back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationsConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            settle_delay_ms: 0,
            user_agent: default_user_agent(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base(),
        }
    }
}

fn default_log_file() -> PathBuf {
    platform::data_dir().join("pegel.log")
}

fn default_interval_secs() -> u64 {
    300
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("pegel-monitor/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_history_capacity() -> usize {
    // two weeks of samples at the default five minute interval
    4032
}

fn default_provider_base() -> String {
    "https://www.hvz.baden-wuerttemberg.de".to_string()
}

impl Config {
    /// Load `config.toml` from the platform config dir, or defaults when the
    /// file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh.interval_secs == 0 || self.refresh.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::InvalidInterval {
                input: self.refresh.interval_secs.to_string(),
            });
        }
        if self.refresh.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "refresh.max_concurrent_fetches must be at least 1".into(),
            ));
        }
        if self.fetcher.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetcher.timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid refresh interval {input:?}: expected a positive whole number up to 7 days")]
    InvalidInterval { input: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Refresh interval ──────────────────────────────────────────────────────────

/// Longest accepted refresh interval: one week.
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Shared, mutable refresh interval in seconds.
///
/// Cloning yields another handle to the same value. The scheduler reads it
/// once per wait, so a change never shortens or extends a wait that is
/// already running.
#[derive(Debug, Clone)]
pub struct RefreshInterval {
    secs: Arc<AtomicU64>,
}

impl RefreshInterval {
    pub fn new(secs: u64) -> Result<Self, ConfigError> {
        if secs == 0 || secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::InvalidInterval {
                input: secs.to_string(),
            });
        }
        Ok(Self {
            secs: Arc::new(AtomicU64::new(secs)),
        })
    }

    pub fn seconds(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }

    pub fn set_seconds(&self, secs: i64) -> Result<u64, ConfigError> {
        let secs = u64::try_from(secs)
            .ok()
            .filter(|s| (1..=MAX_INTERVAL_SECS).contains(s))
            .ok_or_else(|| ConfigError::InvalidInterval {
                input: secs.to_string(),
            })?;
        self.secs.store(secs, Ordering::SeqCst);
        Ok(secs)
    }

    /// Apply user input given in whole minutes. Returns the new interval in
    /// seconds; on error the interval is left as it was.
    pub fn set_minutes_input(&self, input: &str) -> Result<u64, ConfigError> {
        let invalid = || ConfigError::InvalidInterval {
            input: input.to_string(),
        };
        let minutes: i64 = input.trim().parse().map_err(|_| invalid())?;
        let secs = minutes.checked_mul(60).ok_or_else(invalid)?;
        self.set_seconds(secs).map_err(|_| invalid())
    }
}
