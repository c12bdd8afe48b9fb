// src/config.rs

//! Store configuration
//!
//! The host process decides where the daemon socket lives and which review
//! service to talk to; everything here is plain data loaded from TOML with
//! sensible defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default snapd socket
pub const DEFAULT_SNAPD_SOCKET: &str = "/run/snapd.socket";

/// Default review service
pub const DEFAULT_ODRS_SERVER: &str = "https://odrs.gnome.org";

/// Configuration for the store model and its adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file backing the cache
    pub cache_path: PathBuf,
    /// Unix socket of the package daemon
    pub snapd_socket_path: PathBuf,
    /// Base URI of the review service
    pub odrs_server_uri: String,
    /// Timeout applied to HTTP requests
    pub http_timeout_secs: u64,
    /// Number of reviews requested per page
    pub review_page_limit: u32,
    /// User-Agent sent with HTTP requests
    pub user_agent: String,
    /// Interval between polls of an in-flight daemon change
    pub change_poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let cache_path = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("snap-store")
            .join("cache.db");

        Self {
            cache_path,
            snapd_socket_path: PathBuf::from(DEFAULT_SNAPD_SOCKET),
            odrs_server_uri: DEFAULT_ODRS_SERVER.to_string(),
            http_timeout_secs: 30,
            review_page_limit: 40,
            user_agent: format!("snapstore/{}", env!("CARGO_PKG_VERSION")),
            change_poll_interval_ms: 250,
        }
    }
}

impl StoreConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string; missing keys take defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the cache database path
    pub fn with_cache_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_path = path.into();
        self
    }

    /// Set the daemon socket path
    pub fn with_snapd_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapd_socket_path = path.into();
        self
    }

    /// Set the review service URI
    pub fn with_odrs_server_uri(mut self, uri: impl Into<String>) -> Self {
        self.odrs_server_uri = uri.into();
        self
    }

    /// HTTP timeout as a `Duration`
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Change poll interval as a `Duration`
    pub fn change_poll_interval(&self) -> Duration {
        Duration::from_millis(self.change_poll_interval_ms)
    }

    /// Check the configuration for values the adapters cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.snapd_socket_path.as_os_str().is_empty() {
            return Err(Error::Config("snapd_socket_path must not be empty".into()));
        }
        url::Url::parse(&self.odrs_server_uri).map_err(|e| {
            Error::Config(format!(
                "odrs_server_uri '{}' is not a valid URI: {e}",
                self.odrs_server_uri
            ))
        })?;
        if self.http_timeout_secs == 0 {
            return Err(Error::Config("http_timeout_secs must be non-zero".into()));
        }
        if self.review_page_limit == 0 {
            return Err(Error::Config("review_page_limit must be non-zero".into()));
        }
        if self.change_poll_interval_ms == 0 {
            return Err(Error::Config("change_poll_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}
