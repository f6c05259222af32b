//! `arcfetch resume <id>` – queue a paused or failed download again.

use anyhow::{anyhow, bail, Result};
use arcfetch_core::observer::{DownloadStore, RecordState};
use std::path::Path;

pub fn run_resume(store_path: &Path, id: &str) -> Result<()> {
    let mut store = DownloadStore::load(store_path)?;
    let rec = store
        .get_mut(id)
        .ok_or_else(|| anyhow!("unknown download {id}"))?;
    match rec.state {
        RecordState::Paused => rec.state = RecordState::Queued,
        RecordState::Failed => {
            // A failed download starts over.
            if let Some(path) = rec.file_path.take() {
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "deleted partial file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(path = %path.display(), "could not delete file: {}", e),
                }
            }
            rec.received = 0;
            rec.chunks.clear();
            rec.error = None;
            rec.state = RecordState::Queued;
        }
        other => bail!("download {id} is {}, nothing to resume", other.as_str()),
    }
    store.save()?;
    println!("Queued download {id}");
    Ok(())
}
