//! `arcfetch status` – show all recorded downloads.

use anyhow::Result;
use arcfetch_core::observer::{DownloadRecord, DownloadStore};
use std::path::Path;

pub fn run_status(store_path: &Path) -> Result<()> {
    let store = DownloadStore::load(store_path)?;
    if store.records().is_empty() {
        println!("No downloads recorded.");
        return Ok(());
    }
    println!("{:<6} {:<10} {:>5} {:>12} {}", "ID", "STATE", "DONE", "SIZE", "TARGET");
    for rec in store.records() {
        let done = rec
            .percent()
            .map(|p| format!("{p}%"))
            .unwrap_or_else(|| "-".to_string());
        let size = if rec.size > 0 {
            rec.size.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<6} {:<10} {:>5} {:>12} {}",
            rec.id,
            rec.state.as_str(),
            done,
            size,
            target(rec)
        );
        if let Some(err) = &rec.error {
            println!("       error: {err}");
        }
    }
    Ok(())
}

fn target(rec: &DownloadRecord) -> String {
    match &rec.file_path {
        Some(path) => path.display().to_string(),
        None => rec.urls.first().cloned().unwrap_or_default(),
    }
}
