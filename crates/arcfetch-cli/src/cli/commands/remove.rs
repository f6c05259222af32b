//! `arcfetch remove <id>` – cancel a download and drop its record; optionally
//! delete its file with --delete-file.

use anyhow::{anyhow, Result};
use arcfetch_core::observer::DownloadStore;
use std::path::Path;

use crate::cli::control_socket::{self, ControlCommand};

pub async fn run_remove(store_path: &Path, id: &str, delete_file: bool) -> Result<()> {
    let command = ControlCommand::Cancel {
        id: id.to_string(),
        delete_file,
    };
    if let Ok(path) = control_socket::default_path() {
        if control_socket::send(&path, &command).await.unwrap_or(false) {
            println!("Asked running arcfetch to remove download {id}");
            return Ok(());
        }
    }

    let mut store = DownloadStore::load(store_path)?;
    let rec = store
        .remove(id)
        .ok_or_else(|| anyhow!("unknown download {id}"))?;
    if delete_file {
        if let Some(path) = &rec.file_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "deleted file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), "could not delete file: {}", e),
            }
        }
    }
    store.save()?;
    println!("Removed download {id}");
    Ok(())
}
