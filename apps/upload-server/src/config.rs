//! Server configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/chunkup/server.toml`
//! - Windows: `%APPDATA%/chunkup/server.toml`
//!
//! `--config <path>` overrides the location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkup_protocol::constants::WS_MAX_MESSAGE_SIZE;
use chunkup_transfer::ServiceOptions;
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root of the local store. Unfinished uploads live under `.pending`.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Idle time after which an unfinished upload is reaped.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Reject uploads that do not declare their size up front.
    #[serde(default)]
    pub require_declared_size: bool,

    /// Largest accepted chunk payload in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

fn default_port() -> u16 {
    8081
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_chunk_size() -> usize {
    50 * 1024 * 1024
}

/// Room left in a WebSocket message for the chunk frame's length prefix and
/// JSON header.
const CHUNK_FRAME_OVERHEAD: usize = 4096;

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_root: default_storage_root(),
            session_ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            require_declared_size: false,
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the platform default), creating
    /// the file with defaults if it does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.session_ttl_secs == 0 {
            anyhow::bail!("session_ttl_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be positive");
        }
        if self.max_chunk_size == 0 {
            anyhow::bail!("max_chunk_size must be positive");
        }
        let limit = WS_MAX_MESSAGE_SIZE - CHUNK_FRAME_OVERHEAD;
        if self.max_chunk_size > limit {
            anyhow::bail!(
                "max_chunk_size {} exceeds the {limit} bytes a WebSocket message can carry",
                self.max_chunk_size
            );
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            require_declared_size: self.require_declared_size,
            max_chunk_size: Some(self.max_chunk_size),
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("chunkup").join("server.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("chunkup")
            .join("server.toml"))
    }
}
