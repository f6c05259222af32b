//! `arcfetch get <url>...` – download right away with progress output.

use anyhow::{anyhow, Context, Result};
use arcfetch_core::checksum;
use arcfetch_core::config::ArcfetchConfig;
use arcfetch_core::manager::{Progress, ProgressCallback};
use arcfetch_core::observer::ProgressThrottle;
use arcfetch_core::resolver::UrlResolver;
use arcfetch_core::speed::SystemClock;
use arcfetch_core::{DownloadError, DownloadManager, DownloadRequest};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::cli::DownloadArgs;

const GET_ID: &str = "get";
const MIB: f64 = 1_048_576.0;

pub async fn run_get(cfg: &ArcfetchConfig, target: &DownloadArgs, sha256: Option<&str>) -> Result<()> {
    let (manager, coordinator) = DownloadManager::spawn(cfg.manager_config(), UrlResolver::new());

    let mut pending = manager.enqueue(DownloadRequest {
        id: GET_ID.to_string(),
        urls: target.urls.clone(),
        dest_dir: target.dir.clone(),
        options: target.options(),
        progress: Some(progress_printer(&manager)),
    });

    let outcome = tokio::select! {
        outcome = &mut pending => outcome,
        _ = tokio::signal::ctrl_c() => {
            println!();
            if let Err(e) = manager.cancel(GET_ID, true).await {
                tracing::debug!("cancel on interrupt: {}", e);
            }
            let _ = pending.await;
            drop(manager);
            let _ = coordinator.await;
            return Err(anyhow!("download interrupted"));
        }
    };
    drop(manager);
    let _ = coordinator.await;
    println!();

    let path = match outcome {
        Ok(result) => {
            println!("Saved {} ({} bytes)", result.file_path.display(), result.size);
            if result.had_errors {
                println!("  (some chunks were retried)");
            }
            result.file_path
        }
        Err(DownloadError::AlreadyDownloaded { path, .. }) => {
            println!("Already downloaded: {}", path.display());
            path
        }
        Err(e) => return Err(e).context("download failed"),
    };

    if let Some(expected) = sha256 {
        verify(path, expected).await?;
        println!("SHA-256 OK");
    }
    Ok(())
}

async fn verify(path: PathBuf, expected: &str) -> Result<()> {
    let expected = expected.to_string();
    tokio::task::spawn_blocking(move || checksum::verify_sha256(&path, &expected))
        .await
        .context("checksum task join")?
}

/// Progress callback printing one status line, at most twice a second.
fn progress_printer(manager: &DownloadManager) -> ProgressCallback {
    let speed = manager.speed();
    let throttle = Mutex::new(ProgressThrottle::new(Arc::new(SystemClock::new())));
    Arc::new(move |progress: &Progress| {
        let due = throttle
            .lock()
            .map(|mut t| t.should_emit(progress))
            .unwrap_or(true);
        if !due || (progress.file_path.is_some() && progress.received == 0) {
            return;
        }
        let line = status_line(progress, *speed.borrow());
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r{line}  ");
        let _ = out.flush();
    })
}

fn status_line(progress: &Progress, bytes_per_sec: f64) -> String {
    let done = progress.received as f64 / MIB;
    let rate = bytes_per_sec / MIB;
    match progress.total.filter(|&t| t > 0) {
        Some(total) => format!(
            "  {:.1} / {:.1} MiB ({:.1}%)  {:.2} MiB/s",
            done,
            total as f64 / MIB,
            progress.received.min(total) as f64 * 100.0 / total as f64,
            rate
        ),
        None => format!("  {:.1} MiB  {:.2} MiB/s", done, rate),
    }
}
