//! `arcfetch run` – process all queued and paused downloads.

use anyhow::Result;
use arcfetch_core::config::ArcfetchConfig;
use arcfetch_core::observer::{DownloadObserver, DownloadStore, RecordState};
use arcfetch_core::resolver::UrlResolver;
use arcfetch_core::speed::SystemClock;
use arcfetch_core::DownloadManager;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

use crate::cli::control_socket;

pub async fn run_downloads(store_path: &Path, cfg: &ArcfetchConfig) -> Result<()> {
    let store = DownloadStore::load(store_path)?;
    let ids = store.pending_ids();
    if ids.is_empty() {
        println!("No queued downloads.");
        return Ok(());
    }

    let (manager, coordinator) = DownloadManager::spawn(cfg.manager_config(), UrlResolver::new());
    let observer = Arc::new(DownloadObserver::new(
        manager,
        Arc::new(Mutex::new(store)),
        Arc::new(SystemClock::new()),
    ));

    let socket_path = control_socket::default_path().ok();
    let listener = socket_path.as_ref().and_then(|path| {
        match control_socket::spawn_control_listener(Arc::clone(&observer), path) {
            Ok(handle) => {
                tracing::debug!(path = %path.display(), "control socket listening");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "control socket unavailable: {:#}", e);
                None
            }
        }
    });

    println!("Processing {} download(s)", ids.len());
    let mut tasks = JoinSet::new();
    for id in ids.iter().cloned() {
        let observer = Arc::clone(&observer);
        tasks.spawn(async move {
            let state = observer.start(&id).await;
            (id, state)
        });
    }

    let mut counts = Counts::default();
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((id, Ok(state)))) => counts.record(&id, state),
                Some(Ok((id, Err(e)))) => {
                    counts.failed += 1;
                    eprintln!("Download {id}: {e:#}");
                }
                Some(Err(e)) => tracing::error!("download task ended abnormally: {}", e),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("Interrupted, pausing downloads...");
                for id in &ids {
                    if let Err(e) = observer.pause(id).await {
                        tracing::debug!(id = %id, "pause on interrupt: {:#}", e);
                    }
                }
            }
        }
    }

    if let Some(handle) = listener {
        handle.abort();
    }
    if let Some(path) = &socket_path {
        let _ = std::fs::remove_file(path);
    }
    drop(observer);
    let _ = coordinator.await;

    println!(
        "Finished {}, paused {}, failed {}, removed {}",
        counts.finished, counts.paused, counts.failed, counts.removed
    );
    tracing::info!(?counts, "run completed");
    Ok(())
}

#[derive(Debug, Default)]
struct Counts {
    finished: usize,
    paused: usize,
    failed: usize,
    removed: usize,
}

impl Counts {
    fn record(&mut self, id: &str, state: Option<RecordState>) {
        match state {
            Some(RecordState::Finished) => {
                self.finished += 1;
                println!("Download {id}: finished");
            }
            Some(RecordState::Paused) => {
                self.paused += 1;
                println!("Download {id}: paused");
            }
            Some(RecordState::Failed) => {
                self.failed += 1;
                println!("Download {id}: failed (see `arcfetch status`)");
            }
            Some(other) => println!("Download {id}: {}", other.as_str()),
            None => {
                self.removed += 1;
                println!("Download {id}: removed");
            }
        }
    }
}
