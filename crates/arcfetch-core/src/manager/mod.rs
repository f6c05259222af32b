//! Download queue, worker pool and chunk scheduling.
//!
//! [`DownloadManager`] is a cheap handle to a coordinator task that owns all
//! queue and chunk state. Requests and worker events reach that task over
//! channels; nothing else mutates the queue.

mod coordinator;
pub mod naming;
mod queue;
mod sink;
mod types;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::DownloadError;
use crate::resolver::UrlResolver;
use crate::retry::RetryPolicy;
use crate::speed::{Clock, SystemClock};
use crate::worker::TransferSettings;

use coordinator::{Command, Coordinator};

pub use naming::{FileExistsPrompt, RedownloadMode};
pub(crate) use queue::unix_now;
pub use types::{
    Chunk, ChunkState, DownloadId, DownloadOptions, DownloadResult, Progress, ProgressCallback,
    StoredChunk,
};

/// Runtime settings of a [`DownloadManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_workers: usize,
    pub max_chunks_per_download: usize,
    pub min_chunk_size: u64,
    pub retry: RetryPolicy,
    pub speed_horizon_secs: usize,
    pub fsync_interval_bytes: u64,
    pub write_buffer_bytes: usize,
    pub stall_timeout: Duration,
    pub max_stall_resets: u32,
    pub max_redirects: u32,
    pub user_agent: String,
    /// Used when a request names no directory.
    pub download_dir: PathBuf,
    /// Shared by all worker slots.
    pub max_bytes_per_sec: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let transfer = TransferSettings::default();
        Self {
            max_workers: 8,
            max_chunks_per_download: 4,
            min_chunk_size: 20 * 1024 * 1024,
            retry: RetryPolicy::default(),
            speed_horizon_secs: 5,
            fsync_interval_bytes: crate::assembler::DEFAULT_SYNC_INTERVAL,
            write_buffer_bytes: transfer.write_buffer_bytes,
            stall_timeout: transfer.stall_timeout,
            max_stall_resets: transfer.max_stall_resets,
            max_redirects: transfer.max_redirects,
            user_agent: transfer.user_agent,
            download_dir: PathBuf::from("."),
            max_bytes_per_sec: None,
        }
    }
}

impl ManagerConfig {
    /// Transport settings for one worker when `max_workers` slots share the
    /// bandwidth cap.
    pub(crate) fn transfer_settings(&self, max_workers: usize) -> TransferSettings {
        TransferSettings {
            user_agent: self.user_agent.clone(),
            max_redirects: self.max_redirects,
            stall_timeout: self.stall_timeout,
            max_stall_resets: self.max_stall_resets,
            write_buffer_bytes: self.write_buffer_bytes,
            max_recv_speed: self
                .max_bytes_per_sec
                .map(|cap| (cap / max_workers.max(1) as u64).max(1)),
            ..TransferSettings::default()
        }
    }
}

/// A new download.
#[derive(Clone)]
pub struct DownloadRequest {
    pub id: DownloadId,
    /// Candidate URLs; the first one also names the file.
    pub urls: Vec<String>,
    /// Destination directory; the manager's download path when `None`.
    pub dest_dir: Option<PathBuf>,
    pub options: DownloadOptions,
    pub progress: Option<ProgressCallback>,
}

/// A paused download to continue from its persisted chunks.
#[derive(Clone)]
pub struct ResumeRequest {
    pub id: DownloadId,
    /// The partial file.
    pub file_path: PathBuf,
    pub urls: Vec<String>,
    pub received: u64,
    /// Total size; 0 when unknown.
    pub size: u64,
    /// Unix seconds of the original start.
    pub started_secs: u64,
    pub chunks: Vec<StoredChunk>,
    pub progress: Option<ProgressCallback>,
    pub options: DownloadOptions,
}

/// Resolves once the download leaves the queue.
#[must_use = "a download's outcome is only observable through its PendingDownload"]
pub struct PendingDownload {
    rx: oneshot::Receiver<Result<DownloadResult, DownloadError>>,
}

impl Future for PendingDownload {
    type Output = Result<DownloadResult, DownloadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(DownloadError::ManagerShutdown)))
    }
}

/// Handle to a running download manager. Clones share the same queue; the
/// coordinator exits once every handle is dropped and the queue is empty.
#[derive(Clone)]
pub struct DownloadManager {
    commands: mpsc::UnboundedSender<Command>,
    speed: watch::Receiver<f64>,
}

impl DownloadManager {
    /// Start a manager on the current runtime.
    pub fn spawn(config: ManagerConfig, resolver: UrlResolver) -> (Self, JoinHandle<()>) {
        Self::spawn_with_clock(config, resolver, Arc::new(SystemClock::new()))
    }

    pub fn spawn_with_clock(
        config: ManagerConfig,
        resolver: UrlResolver,
        clock: Arc<dyn Clock>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (speed_tx, speed) = watch::channel(0.0);
        let coordinator = Coordinator::new(config, resolver, clock, rx, speed_tx);
        let handle = tokio::spawn(coordinator.run());
        (Self { commands, speed }, handle)
    }

    /// Queue a new download.
    pub fn enqueue(&self, request: DownloadRequest) -> PendingDownload {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Enqueue { request, reply });
        PendingDownload { rx }
    }

    /// Continue a paused download from its confirmed chunks.
    pub fn resume(&self, request: ResumeRequest) -> PendingDownload {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Resume { request, reply });
        PendingDownload { rx }
    }

    /// Stop a download, keeping its partial file. Returns the chunks to
    /// persist for a later [`resume`](Self::resume).
    pub async fn pause(&self, id: &str) -> Result<Vec<StoredChunk>, DownloadError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Pause {
                id: id.to_string(),
                reply,
            })
            .map_err(|_| DownloadError::ManagerShutdown)?;
        rx.await.map_err(|_| DownloadError::ManagerShutdown)?
    }

    pub async fn cancel(&self, id: &str, delete_file: bool) -> Result<(), DownloadError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel {
                id: id.to_string(),
                delete_file,
                reply,
            })
            .map_err(|_| DownloadError::ManagerShutdown)?;
        rx.await.map_err(|_| DownloadError::ManagerShutdown)?
    }

    pub fn set_max_concurrent_downloads(&self, max_workers: usize) {
        let _ = self.commands.send(Command::SetMaxWorkers(max_workers));
    }

    pub fn set_download_path(&self, path: PathBuf) {
        let _ = self.commands.send(Command::SetDownloadPath(path));
    }

    /// Prompt used by downloads queued with [`RedownloadMode::Ask`].
    pub fn set_file_exists_prompt(&self, prompt: Arc<dyn FileExistsPrompt>) {
        let _ = self.commands.send(Command::SetFileExistsPrompt(prompt));
    }

    /// Aggregate download rate in bytes per second, updated every second.
    pub fn speed(&self) -> watch::Receiver<f64> {
        self.speed.clone()
    }
}
