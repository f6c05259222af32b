//! CLI for the arcfetch download engine.

mod commands;
mod control_socket;

use anyhow::Result;
use arcfetch_core::config;
use arcfetch_core::manager::{DownloadOptions, RedownloadMode};
use arcfetch_core::observer::DownloadStore;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use commands::{
    run_add, run_checksum, run_downloads, run_get, run_pause, run_remove, run_resume, run_status,
};

/// Top-level CLI for arcfetch.
#[derive(Debug, Parser)]
#[command(name = "arcfetch")]
#[command(about = "arcfetch: chunked, resumable, parallel HTTP downloads", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

/// What to download and where to put it.
#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Candidate URLs for the same file; the first one names it.
    #[arg(required = true, num_args = 1..)]
    pub urls: Vec<String>,

    /// Destination directory (default: config `download_dir` or the current directory).
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// File name to save as instead of the one derived from the URL.
    #[arg(long)]
    pub name: Option<String>,

    /// What to do if the file already exists: always, never, ask or replace.
    #[arg(long, default_value = "always", value_name = "MODE")]
    pub redownload: RedownloadMode,
}

impl DownloadArgs {
    pub fn options(&self) -> DownloadOptions {
        DownloadOptions {
            file_name: self.name.clone(),
            redownload: self.redownload,
            ..DownloadOptions::default()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Record a download to be fetched by `run`.
    Add {
        #[command(flatten)]
        target: DownloadArgs,
    },

    /// Process all queued and paused downloads.
    Run,

    /// Download right away, showing progress.
    Get {
        #[command(flatten)]
        target: DownloadArgs,

        /// Expected SHA-256 (hex) of the finished file.
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,
    },

    /// Show all recorded downloads.
    Status,

    /// Pause a download by its ID.
    Pause {
        /// Download identifier.
        id: String,
    },

    /// Queue a paused or failed download again.
    Resume {
        /// Download identifier.
        id: String,
    },

    /// Cancel and forget a download.
    Remove {
        /// Download identifier.
        id: String,

        /// Also delete the (partial) file.
        #[arg(long)]
        delete_file: bool,
    },

    /// Compute SHA-256 of a file.
    Checksum {
        /// Path to the file.
        path: PathBuf,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let store_path = DownloadStore::default_path()?;

        match cli.command {
            CliCommand::Add { target } => run_add(&store_path, &target)?,
            CliCommand::Run => run_downloads(&store_path, &cfg).await?,
            CliCommand::Get { target, sha256 } => run_get(&cfg, &target, sha256.as_deref()).await?,
            CliCommand::Status => run_status(&store_path)?,
            CliCommand::Pause { id } => run_pause(&store_path, &id).await?,
            CliCommand::Resume { id } => run_resume(&store_path, &id)?,
            CliCommand::Remove { id, delete_file } => {
                run_remove(&store_path, &id, delete_file).await?
            }
            CliCommand::Checksum { path } => run_checksum(&path).await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
