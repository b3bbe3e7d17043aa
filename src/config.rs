//! Configuration for the spider engine.
//!
//! Covers the two persistence tiers (download directory and cache directory),
//! the gallery site base URL, and HTTP client settings. The config can be
//! loaded from and saved to a TOML file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderConfig {
    /// Directory galleries are downloaded into. Also holds the preferred
    /// copy of the per-gallery spider info record.
    pub download_dir: PathBuf,
    /// Cache directory. Holds the fallback spider info copy and pages
    /// fetched while reading interactively.
    pub cache_dir: PathBuf,
    /// Base URL of the gallery site, without a trailing slash.
    pub base_url: String,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Connection timeout for new connections, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Overall request timeout, in seconds. Large enough for full images.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_user_agent() -> String {
    format!("gallery-spider/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl SpiderConfig {
    /// Create a config with default HTTP settings.
    pub fn new(
        download_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        base_url: impl Into<String>,
    ) -> Self {
        SpiderConfig {
            download_dir: download_dir.into(),
            cache_dir: cache_dir.into(),
            base_url: base_url.into(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Load a config from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save the config to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Path of the cache-tier spider info record for a gallery.
    pub fn info_cache_path(&self, gid: u64) -> PathBuf {
        self.cache_dir.join(gid.to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
