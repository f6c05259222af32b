use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::manager::ManagerConfig;
use crate::retry::RetryPolicy;

const MIB: u64 = 1024 * 1024;

/// Backoff between chunk restarts after hard errors (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

/// Global configuration loaded from `~/.config/arcfetch/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcfetchConfig {
    /// Worker slots shared by all downloads.
    pub max_workers: usize,
    /// Pieces the remainder of a file is split into after discovery.
    pub max_chunks_per_download: usize,
    /// Size of the discovery chunk and lower bound for split pieces.
    pub min_chunk_size: u64,
    /// Restarts allowed per chunk after hard errors.
    pub max_restarts: u32,
    /// Seconds of history kept by the speed calculator.
    pub speed_horizon_secs: usize,
    /// Cumulative bytes written between fsyncs.
    pub fsync_interval_bytes: u64,
    /// Bytes a worker gathers before handing them to the file.
    pub write_buffer_bytes: usize,
    /// Seconds without data before a connection is considered stalled.
    pub stall_timeout_secs: u64,
    /// Times a worker reconnects by itself after a stall.
    pub max_stall_resets: u32,
    /// Redirect hops followed per request.
    pub max_redirects: u32,
    pub user_agent: String,
    /// Default destination directory (None = current directory).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Optional bandwidth cap in bytes per second, split across worker slots.
    #[serde(default)]
    pub max_bytes_per_sec: Option<u64>,
    /// Optional retry backoff; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ArcfetchConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_chunks_per_download: 4,
            min_chunk_size: 20 * MIB,
            max_restarts: 3,
            speed_horizon_secs: 5,
            fsync_interval_bytes: MIB,
            write_buffer_bytes: 256 * 1024,
            stall_timeout_secs: 15,
            max_stall_resets: 2,
            max_redirects: 5,
            user_agent: default_user_agent(),
            download_dir: None,
            max_bytes_per_sec: None,
            retry: None,
        }
    }
}

pub fn default_user_agent() -> String {
    format!("arcfetch/{}", env!("CARGO_PKG_VERSION"))
}

impl ArcfetchConfig {
    /// Runtime settings for the download manager.
    pub fn manager_config(&self) -> ManagerConfig {
        let retry = self.retry.clone().unwrap_or_default();
        let download_dir = self
            .download_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        ManagerConfig {
            max_workers: self.max_workers,
            max_chunks_per_download: self.max_chunks_per_download.max(1),
            min_chunk_size: self.min_chunk_size.max(1),
            retry: RetryPolicy {
                max_restarts: self.max_restarts,
                base_delay: Duration::from_secs_f64(retry.base_delay_secs.max(0.0)),
                max_delay: Duration::from_secs(retry.max_delay_secs),
            },
            speed_horizon_secs: self.speed_horizon_secs.max(1),
            fsync_interval_bytes: self.fsync_interval_bytes,
            write_buffer_bytes: self.write_buffer_bytes.max(1),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs.max(1)),
            max_stall_resets: self.max_stall_resets,
            max_redirects: self.max_redirects,
            user_agent: self.user_agent.clone(),
            download_dir,
            max_bytes_per_sec: self.max_bytes_per_sec,
        }
    }
}

/// `~/.local/state/arcfetch`: log file, download records and control socket.
pub fn state_dir() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("arcfetch")?;
    Ok(xdg_dirs.get_state_home().join("arcfetch"))
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("arcfetch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<ArcfetchConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ArcfetchConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: ArcfetchConfig =
        toml::from_str(&data).with_context(|| format!("parse config: {}", path.display()))?;
    Ok(cfg)
}
