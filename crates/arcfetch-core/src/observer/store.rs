//! Download records persisted as JSON under the XDG state dir.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::manager::{DownloadOptions, StoredChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Queued,
    Running,
    Paused,
    Finished,
    Failed,
}

impl RecordState {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Queued => "queued",
            RecordState::Running => "running",
            RecordState::Paused => "paused",
            RecordState::Finished => "finished",
            RecordState::Failed => "failed",
        }
    }
}

/// Everything needed to start, show or resume one download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub urls: Vec<String>,
    #[serde(default)]
    pub dest_dir: Option<PathBuf>,
    /// Reserved (partial) file, then the final file.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    pub state: RecordState,
    #[serde(default)]
    pub received: u64,
    /// 0 while unknown.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub started_secs: u64,
    /// Confirmed chunk positions from the last flush or pause.
    #[serde(default)]
    pub chunks: Vec<StoredChunk>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub options: DownloadOptions,
}

impl DownloadRecord {
    pub fn new(id: String, urls: Vec<String>, dest_dir: Option<PathBuf>, options: DownloadOptions) -> Self {
        Self {
            id,
            urls,
            dest_dir,
            file_path: None,
            state: RecordState::Queued,
            received: 0,
            size: 0,
            started_secs: 0,
            chunks: Vec::new(),
            error: None,
            options,
        }
    }

    /// Whole percent done, if the size is known.
    pub fn percent(&self) -> Option<u64> {
        (self.size > 0).then(|| (self.received.min(self.size) * 100) / self.size)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    downloads: Vec<DownloadRecord>,
}

/// In-memory copy of the record file; [`save`](Self::save) writes it back.
#[derive(Debug)]
pub struct DownloadStore {
    path: PathBuf,
    next_id: u64,
    records: Vec<DownloadRecord>,
}

impl DownloadStore {
    /// `~/.local/state/arcfetch/downloads.json`.
    pub fn default_path() -> Result<PathBuf> {
        Ok(crate::config::state_dir()?.join("downloads.json"))
    }

    /// Load the store at `path`; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let file = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<StoreFile>(&bytes)
                .with_context(|| format!("parse download store: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("read download store: {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            next_id: file.next_id,
            records: file.downloads,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store, replacing the previous file atomically.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        let file = StoreFile {
            next_id: self.next_id,
            downloads: self.records.clone(),
        };
        let json = serde_json::to_vec_pretty(&file).context("serialize download store")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace download store: {}", self.path.display()))?;
        Ok(())
    }

    pub fn records(&self) -> &[DownloadRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&DownloadRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DownloadRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Add a queued record under a fresh id and return the id.
    pub fn add(&mut self, urls: Vec<String>, dest_dir: Option<PathBuf>, options: DownloadOptions) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();
        self.records
            .push(DownloadRecord::new(id.clone(), urls, dest_dir, options));
        id
    }

    pub fn remove(&mut self, id: &str) -> Option<DownloadRecord> {
        let idx = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(idx))
    }

    /// Ids of records `run` should process, oldest first.
    pub fn pending_ids(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| {
                matches!(
                    r.state,
                    RecordState::Queued | RecordState::Running | RecordState::Paused
                )
            })
            .map(|r| r.id.clone())
            .collect()
    }
}
