//! Engine options and the TOML configuration file that feeds them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default expiry for schema cache entries.
pub const DEFAULT_SCHEMA_CACHE_TTL: Duration = Duration::from_secs(300);

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SOMBRA_BUCKET_CONFIG";

/// Substrate durability mode applied at open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync on every commit.
    Full,
    /// Sync at checkpoints only.
    Normal,
    /// Leave syncing to the OS.
    Off,
}

impl Synchronous {
    pub(crate) fn pragma_value(self) -> &'static str {
        match self {
            Synchronous::Full => "FULL",
            Synchronous::Normal => "NORMAL",
            Synchronous::Off => "OFF",
        }
    }
}

/// Options controlling a [`crate::BucketStore`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// How long a resolved bucket schema stays fresh.
    pub schema_cache_ttl: Duration,
    /// Number of buckets the schema cache holds.
    pub schema_cache_capacity: usize,
    /// Row limit applied to `find` when the caller sets none.
    pub default_find_limit: u64,
    /// How long a statement waits on a locked substrate before failing.
    pub busy_timeout: Duration,
    /// Durability mode for file-backed databases.
    pub synchronous: Synchronous,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            schema_cache_ttl: DEFAULT_SCHEMA_CACHE_TTL,
            schema_cache_capacity: 1024,
            default_find_limit: 1000,
            busy_timeout: Duration::from_secs(5),
            synchronous: Synchronous::Full,
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Default)]
pub struct FileConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl FileConfig {
    /// Loads `explicit`, `$SOMBRA_BUCKET_CONFIG` or the default path, in that
    /// order. A missing file yields defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        Ok(Self { path, data })
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let data = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(Self { path: None, data })
    }

    /// Path the config was (or would have been) read from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Database path named by `[database] default`.
    pub fn default_db_path(&self) -> Option<&PathBuf> {
        self.data.database.default_path.as_ref()
    }

    /// Store options with file overrides applied over the defaults.
    pub fn store_options(&self) -> StoreOptions {
        let mut opts = StoreOptions::default();
        let raw = &self.data.store;
        if let Some(secs) = raw.schema_cache_ttl_secs {
            opts.schema_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = raw.schema_cache_capacity {
            opts.schema_cache_capacity = capacity;
        }
        if let Some(limit) = raw.default_find_limit {
            opts.default_find_limit = limit;
        }
        if let Some(ms) = raw.busy_timeout_ms {
            opts.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(sync) = raw.synchronous {
            opts.synchronous = sync;
        }
        opts
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    store: StoreSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DatabaseSection {
    #[serde(rename = "default")]
    default_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoreSection {
    schema_cache_ttl_secs: Option<u64>,
    schema_cache_capacity: Option<usize>,
    default_find_limit: Option<u64>,
    busy_timeout_ms: Option<u64>,
    synchronous: Option<Synchronous>,
}

/// Errors raised while loading configuration.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Default config location under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sombra-bucket").join("config.toml"))
}
