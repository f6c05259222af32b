//! Glue between persisted download records and the download manager.
//!
//! The observer starts, pauses and cancels downloads on behalf of an
//! application and mirrors every progress report and outcome into the
//! [`DownloadStore`], so an interrupted session can pick up where it left off.

mod store;

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{DownloadError, ErrorKind};
use crate::manager::{
    DownloadManager, DownloadRequest, DownloadResult, Progress, ProgressCallback,
    RedownloadMode, ResumeRequest,
};
use crate::speed::Clock;

pub use store::{DownloadRecord, DownloadStore, RecordState};

/// Minimum spacing of progress writes to the store.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Decides which progress reports are worth persisting.
pub struct ProgressThrottle {
    clock: Arc<dyn Clock>,
    last: Option<Duration>,
    last_percent: Option<u64>,
}

impl ProgressThrottle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: None,
            last_percent: None,
        }
    }

    /// True at most every [`PROGRESS_INTERVAL`], unless the whole percent
    /// changed or the report names a file.
    pub fn should_emit(&mut self, progress: &Progress) -> bool {
        let now = self.clock.elapsed();
        let percent = progress
            .total
            .filter(|&t| t > 0)
            .map(|t| progress.received.min(t) * 100 / t);
        let due = progress.file_path.is_some()
            || percent != self.last_percent
            || self
                .last
                .map_or(true, |last| now.saturating_sub(last) >= PROGRESS_INTERVAL);
        if due {
            self.last = Some(now);
            self.last_percent = percent;
        }
        due
    }
}

pub struct DownloadObserver {
    manager: DownloadManager,
    store: Arc<Mutex<DownloadStore>>,
    clock: Arc<dyn Clock>,
}

impl DownloadObserver {
    pub fn new(manager: DownloadManager, store: Arc<Mutex<DownloadStore>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            manager,
            store,
            clock,
        }
    }

    pub fn store(&self) -> Arc<Mutex<DownloadStore>> {
        self.store.clone()
    }

    /// Start or continue the download of record `id` and wait until it
    /// leaves the manager. Returns the record's new state (`None` when the
    /// record was removed by a cancel).
    pub async fn start(&self, id: &str) -> Result<Option<RecordState>> {
        let record = lock(&self.store)
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown download {id}"))?;
        let progress = self.progress_callback(id);

        // Records keep their chunks while queued again after a pause.
        let resumable = record.state != RecordState::Failed && !record.chunks.is_empty();
        let pending = match (resumable, &record.file_path) {
            _ if record.state == RecordState::Finished => return Ok(Some(RecordState::Finished)),
            (true, Some(file_path)) => {
                tracing::info!(id, path = %file_path.display(), "resuming download");
                self.manager.resume(ResumeRequest {
                    id: record.id.clone(),
                    file_path: file_path.clone(),
                    urls: record.urls.clone(),
                    received: record.received,
                    size: record.size,
                    started_secs: record.started_secs,
                    chunks: record.chunks.clone(),
                    progress: Some(progress),
                    options: record.options.clone(),
                })
            }
            _ => {
                let mut options = record.options.clone();
                if record.state == RecordState::Failed {
                    options.redownload = RedownloadMode::Replace;
                }
                tracing::info!(id, url = %record.urls.first().map(String::as_str).unwrap_or(""), "starting download");
                self.manager.enqueue(DownloadRequest {
                    id: record.id.clone(),
                    urls: record.urls.clone(),
                    dest_dir: record.dest_dir.clone(),
                    options,
                    progress: Some(progress),
                })
            }
        };

        {
            let mut store = lock(&self.store);
            if let Some(rec) = store.get_mut(id) {
                rec.state = RecordState::Running;
                rec.error = None;
                if rec.started_secs == 0 {
                    rec.started_secs = crate::manager::unix_now();
                }
            }
            store.save()?;
        }

        let outcome = pending.await;
        let mut store = lock(&self.store);
        let state = apply_outcome(&mut store, id, outcome);
        store.save()?;
        Ok(state)
    }

    /// Pause a download and persist its chunks. Records the manager does
    /// not know are only marked paused.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let chunks = match self.manager.pause(id).await {
            Ok(chunks) => Some(chunks),
            Err(DownloadError::UnknownDownload(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let mut store = lock(&self.store);
        let rec = store
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown download {id}"))?;
        match chunks {
            Some(chunks) => rec.chunks = chunks,
            None if matches!(rec.state, RecordState::Queued | RecordState::Running) => {}
            None => return Ok(()),
        }
        rec.state = RecordState::Paused;
        store.save()
    }

    /// Cancel a download. Records the manager does not know are dropped
    /// directly.
    pub async fn cancel(&self, id: &str, delete_file: bool) -> Result<()> {
        match self.manager.cancel(id, delete_file).await {
            Ok(()) => Ok(()),
            Err(DownloadError::UnknownDownload(_)) => {
                let mut store = lock(&self.store);
                if let Some(rec) = store.remove(id) {
                    if let (true, Some(path)) = (delete_file, rec.file_path.as_deref()) {
                        remove_partial(path);
                    }
                }
                store.save()
            }
            Err(e) => Err(e.into()),
        }
    }

    fn progress_callback(&self, id: &str) -> ProgressCallback {
        let store = self.store.clone();
        let id = id.to_string();
        let throttle = Mutex::new(ProgressThrottle::new(self.clock.clone()));
        Arc::new(move |progress: &Progress| {
            let mut store = lock(&store);
            let Some(rec) = store.get_mut(&id) else {
                return;
            };
            rec.received = progress.received;
            if let Some(total) = progress.total {
                rec.size = total;
            }
            if let Some(chunks) = &progress.chunks {
                rec.chunks = chunks.clone();
            }
            if let Some(path) = &progress.file_path {
                rec.file_path = Some(path.clone());
            }
            let emit = throttle
                .lock()
                .map(|mut t| t.should_emit(progress))
                .unwrap_or(true);
            if emit {
                if let Err(e) = store.save() {
                    tracing::warn!(id = %id, "failed to save progress: {:#}", e);
                }
            }
        })
    }
}

/// Mirror a download's outcome into its record.
pub fn apply_outcome(
    store: &mut DownloadStore,
    id: &str,
    outcome: Result<DownloadResult, DownloadError>,
) -> Option<RecordState> {
    if let Err(e) = &outcome {
        if e.kind() == ErrorKind::UserCanceled {
            store.remove(id);
            return None;
        }
    }
    let rec = store.get_mut(id)?;
    match outcome {
        Ok(result) if !result.unfinished_chunks.is_empty() => {
            rec.state = RecordState::Paused;
            rec.chunks = result.unfinished_chunks;
            rec.file_path = Some(result.file_path);
            if result.size > 0 {
                rec.size = result.size;
            }
        }
        Ok(result) => {
            rec.state = RecordState::Finished;
            rec.chunks.clear();
            rec.file_path = Some(result.file_path);
            rec.size = result.size;
            rec.received = result.size;
        }
        Err(DownloadError::AlreadyDownloaded { path, .. }) => {
            rec.state = RecordState::Finished;
            rec.chunks.clear();
            rec.file_path = Some(path);
        }
        Err(e) => {
            if e.kind() == ErrorKind::Html {
                if let Some(path) = rec.file_path.take() {
                    remove_partial(&path);
                }
                rec.received = 0;
            }
            rec.state = RecordState::Failed;
            rec.chunks.clear();
            rec.error = Some(e.to_string());
        }
    }
    Some(rec.state)
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "failed to remove partial file: {}", e),
    }
}

fn lock(store: &Mutex<DownloadStore>) -> MutexGuard<'_, DownloadStore> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}
