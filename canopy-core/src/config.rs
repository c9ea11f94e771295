//! Cache configuration.
//!
//! Settings are loaded from a TOML file named by `--config <path>` or the
//! `CANOPY_CACHE_CONFIG` environment variable. Every field has a default so
//! a partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheResult, ConfigError};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CANOPY_CACHE_CONFIG";

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_SIZE: usize = 100;
pub const DEFAULT_WARM_UP_COUNT: usize = 20;
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAP_SIZE_MB: usize = 64;

/// Whether the cache participates in reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Enabled,
    Disabled,
}

impl CacheMode {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Durable store location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Directory holding the LMDB environment.
    pub path: PathBuf,
    /// LMDB map size in megabytes.
    pub map_size_mb: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./canopy-cache"),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

/// Process-wide cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl_ms: u64,
    /// Fast tier capacity in entries.
    pub max_size: usize,
    /// Number of most-used durable rows loaded into the fast tier on startup.
    pub warm_up_count: usize,
    pub prune_interval_ms: u64,
    pub store: StoreSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: DEFAULT_TTL.as_millis() as u64,
            max_size: DEFAULT_MAX_SIZE,
            warm_up_count: DEFAULT_WARM_UP_COUNT,
            prune_interval_ms: DEFAULT_PRUNE_INTERVAL.as_millis() as u64,
            store: StoreSettings::default(),
        }
    }
}

impl CacheSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the cache.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the default entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the fast tier capacity.
    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    /// Set how many rows are warmed into the fast tier on startup.
    pub fn with_warm_up_count(mut self, count: usize) -> Self {
        self.warm_up_count = count;
        self
    }

    /// Set the periodic prune interval.
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the durable store directory.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = path.into();
        self
    }

    pub fn mode(&self) -> CacheMode {
        CacheMode::from_enabled(self.enabled)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    /// Load from `--config <path>` or `CANOPY_CACHE_CONFIG`.
    pub fn load() -> CacheResult<Self> {
        let path = config_path_from_args()
            .or_else(config_path_from_env)
            .ok_or(ConfigError::MissingConfigPath)?;
        let settings = Self::from_path(&path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Like [`CacheSettings::load`], but falls back to defaults when no path
    /// was given.
    pub fn load_or_default() -> CacheResult<Self> {
        match Self::load() {
            Err(crate::CacheError::Config(ConfigError::MissingConfigPath)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn from_path(path: &Path) -> CacheResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> CacheResult<Self> {
        let settings: CacheSettings = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Ok(settings)
    }

    /// Validate the settings.
    ///
    /// Validates:
    /// - default_ttl_ms > 0
    /// - max_size > 0
    /// - prune_interval_ms > 0
    /// - store.map_size_mb > 0 and store.path is not empty
    pub fn validate(&self) -> CacheResult<()> {
        if self.default_ttl_ms == 0 {
            return Err(invalid("default_ttl_ms", self.default_ttl_ms, "must be > 0"));
        }
        if self.max_size == 0 {
            return Err(invalid("max_size", self.max_size, "must be > 0"));
        }
        if self.prune_interval_ms == 0 {
            return Err(invalid(
                "prune_interval_ms",
                self.prune_interval_ms,
                "must be > 0",
            ));
        }
        if self.store.map_size_mb == 0 {
            return Err(invalid(
                "store.map_size_mb",
                self.store.map_size_mb,
                "must be > 0",
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(invalid("store.path", "\"\"", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::CacheError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
