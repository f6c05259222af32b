//! Tracing setup: a log file under the XDG state dir, or stderr as fallback.

use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "arcfetch.log";

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,arcfetch=debug,arcfetch_core=debug";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Append structured logs to `~/.local/state/arcfetch/arcfetch.log` and
/// return that path. Errors if the file cannot be opened or a subscriber is
/// already installed, so the caller can use [`init_logging_stderr`] instead.
pub fn init_logging() -> Result<PathBuf> {
    let dir = crate::config::state_dir()?;
    std::fs::create_dir_all(&dir).with_context(|| format!("create log dir: {}", dir.display()))?;
    let path = dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file: {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_FILTER))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("install subscriber: {e}"))?;

    tracing::info!(path = %path.display(), "arcfetch logging initialized");
    Ok(path)
}

/// Warnings and errors to stderr. Never fails; a subscriber that is already
/// installed stays in place.
pub fn init_logging_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
