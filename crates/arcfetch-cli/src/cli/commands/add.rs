//! `arcfetch add <url>...` – record a queued download.

use anyhow::Result;
use arcfetch_core::observer::DownloadStore;
use std::path::Path;

use crate::cli::DownloadArgs;

pub fn run_add(store_path: &Path, target: &DownloadArgs) -> Result<()> {
    let mut store = DownloadStore::load(store_path)?;
    let id = store.add(target.urls.clone(), target.dir.clone(), target.options());
    store.save()?;
    println!("Added download {id} for URL: {}", target.urls[0]);
    Ok(())
}
