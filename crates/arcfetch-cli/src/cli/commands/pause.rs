//! `arcfetch pause <id>` – pause a download. If `arcfetch run` is active, it
//! pauses the transfer and persists its chunks; otherwise the record is marked
//! paused directly.

use anyhow::{anyhow, bail, Result};
use arcfetch_core::observer::{DownloadStore, RecordState};
use std::path::Path;

use crate::cli::control_socket::{self, ControlCommand};

pub async fn run_pause(store_path: &Path, id: &str) -> Result<()> {
    if let Ok(path) = control_socket::default_path() {
        if control_socket::send(&path, &ControlCommand::Pause(id.to_string()))
            .await
            .unwrap_or(false)
        {
            println!("Asked running arcfetch to pause download {id}");
            return Ok(());
        }
    }

    let mut store = DownloadStore::load(store_path)?;
    let rec = store
        .get_mut(id)
        .ok_or_else(|| anyhow!("unknown download {id}"))?;
    match rec.state {
        RecordState::Queued | RecordState::Running | RecordState::Paused => {
            rec.state = RecordState::Paused
        }
        other => bail!("download {id} is {}", other.as_str()),
    }
    store.save()?;
    println!("Paused download {id}");
    Ok(())
}
