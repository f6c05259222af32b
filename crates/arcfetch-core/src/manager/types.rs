//! Downloads, chunks and the values exchanged with callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::naming::RedownloadMode;
use crate::error::DownloadError;
use crate::resolver::Sources;
use crate::worker::WorkerId;

pub type DownloadId = String;

/// Per-download request options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Explicit file name; otherwise derived from the first URL.
    pub file_name: Option<String>,
    pub redownload: RedownloadMode,
    pub referer: Option<String>,
    /// `name=value` pairs sent as the `Cookie` header.
    pub cookies: Vec<String>,
    pub headers: Vec<(String, String)>,
    /// Display name handed to protocol handlers.
    pub name_hint: Option<String>,
}

/// Unfinished part of a download as persisted for resume. Values are the
/// confirmed (durably written) position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChunk {
    #[serde(default)]
    pub url: Option<String>,
    pub offset: u64,
    pub size: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Init,
    Running,
    Paused,
    Finished,
}

/// Why the manager stopped a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// Too slow; rerun the chunk on the next mirror.
    Restart,
    /// A ranged request came back without a total; refetch the whole body.
    Unranged,
}

/// One contiguous byte range of a download.
///
/// `offset`/`size` describe the part still to be fetched: streaming moves
/// `offset` forward, grows `received` and shrinks `size`. The confirmed
/// triple follows the same rules but only for bytes the file assembler has
/// taken, so it never runs ahead of the live values.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// URL of the latest response for this chunk.
    pub url: Option<String>,
    pub offset: u64,
    pub size: u64,
    pub received: u64,
    pub confirmed_offset: u64,
    pub confirmed_size: u64,
    pub confirmed_received: u64,
    pub state: ChunkState,
    pub worker_id: Option<WorkerId>,
    pub restart_count: u32,
    pub extra_cookies: Vec<String>,
    pub extra_headers: Vec<(String, String)>,
    /// Not eligible for scheduling before this point on the manager clock.
    pub not_before: Option<Duration>,
    /// Index into the resolved URL list, advanced on restarts.
    pub mirror_index: usize,
    /// Size unknown; the chunk ends with the stream.
    pub open_ended: bool,
    pub(crate) stop: Option<StopReason>,
    /// `received` when the current worker started.
    pub(crate) attempt_start: u64,
}

impl Chunk {
    pub fn new(offset: u64, size: u64, received: u64) -> Self {
        Self {
            url: None,
            offset,
            size,
            received,
            confirmed_offset: offset,
            confirmed_size: size,
            confirmed_received: received,
            state: ChunkState::Init,
            worker_id: None,
            restart_count: 0,
            extra_cookies: Vec::new(),
            extra_headers: Vec::new(),
            not_before: None,
            mirror_index: 0,
            open_ended: false,
            stop: None,
            attempt_start: received,
        }
    }

    pub fn from_stored(stored: &StoredChunk) -> Self {
        let mut chunk = Self::new(stored.offset, stored.size, stored.received);
        chunk.url = stored.url.clone();
        chunk
    }

    /// Byte range `[start, end)` this chunk covers in the file.
    pub fn span(&self) -> (u64, u64) {
        (
            self.offset.saturating_sub(self.received),
            self.offset + self.size,
        )
    }

    /// Every byte of the span has reached the assembler.
    pub fn is_complete(&self) -> bool {
        !self.open_ended && self.confirmed_size == 0
    }

    pub fn to_stored(&self) -> StoredChunk {
        StoredChunk {
            url: self.url.clone(),
            offset: self.confirmed_offset,
            size: self.confirmed_size,
            received: self.confirmed_received,
        }
    }

    /// Move the end of the chunk to absolute offset `end`.
    pub(crate) fn set_end(&mut self, end: u64) {
        self.open_ended = false;
        self.size = end.saturating_sub(self.offset);
        self.confirmed_size = end.saturating_sub(self.confirmed_offset);
    }

    /// Apply bytes received from the network.
    pub(crate) fn advance(&mut self, len: u64) {
        self.offset += len;
        self.received += len;
        self.size = self.size.saturating_sub(len);
    }

    /// Apply bytes the assembler has taken at `offset`.
    pub(crate) fn confirm(&mut self, offset: u64, len: u64) {
        self.confirmed_offset = offset + len;
        self.confirmed_received += len;
        self.confirmed_size = self.confirmed_size.saturating_sub(len);
    }

    /// Continue from the confirmed position.
    pub(crate) fn reset_to_confirmed(&mut self) {
        self.offset = self.confirmed_offset;
        self.size = self.confirmed_size;
        self.received = self.confirmed_received;
        self.state = ChunkState::Init;
        self.worker_id = None;
        self.stop = None;
    }

    /// Start over from the beginning of the span.
    pub(crate) fn rewind(&mut self) {
        let (start, end) = self.span();
        self.offset = start;
        self.received = 0;
        self.size = if self.open_ended { 0 } else { end - start };
        self.confirmed_offset = self.offset;
        self.confirmed_size = self.size;
        self.confirmed_received = 0;
        self.state = ChunkState::Init;
        self.worker_id = None;
        self.stop = None;
    }
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub received: u64,
    pub total: Option<u64>,
    /// Set when the write that produced this update was synced to disk.
    pub chunks: Option<Vec<StoredChunk>>,
    pub chunkable: Option<bool>,
    pub urls: Option<Vec<String>>,
    /// Reported on enqueue and on finalization.
    pub file_path: Option<PathBuf>,
}

pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Outcome of a download that stopped without error.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub headers: HashMap<String, String>,
    /// Non-empty when the download was paused.
    pub unfinished_chunks: Vec<StoredChunk>,
    /// Some chunk had to be restarted after a hard error.
    pub had_errors: bool,
    pub size: u64,
    pub meta_info: serde_json::Value,
}

pub(crate) type ResultSender = oneshot::Sender<Result<DownloadResult, DownloadError>>;

/// Lifecycle position of a download while the manager holds it.
#[derive(Debug)]
pub(crate) enum Phase {
    Queued,
    /// First request is out; size and range support unknown.
    Discovery,
    Running,
    Pausing,
    Canceling { delete_file: bool },
    Failing(DownloadError),
}

impl Phase {
    pub(crate) fn is_active(&self) -> bool {
        matches!(self, Phase::Queued | Phase::Discovery | Phase::Running)
    }
}

pub(crate) struct Download {
    pub id: DownloadId,
    /// Name the download was queued under.
    pub orig_name: String,
    /// Reserved path the data is written to.
    pub temp_path: PathBuf,
    /// Name announced by the server, reserved next to the temp file.
    pub final_path: Option<PathBuf>,
    /// A final name reservation is in flight.
    pub final_name_pending: bool,
    /// The first response may still rename the download.
    pub rename_allowed: bool,
    pub sources: Arc<Sources>,
    pub options: DownloadOptions,
    /// Unix seconds.
    pub started_secs: u64,
    /// Start on the manager clock.
    pub started_at: Duration,
    pub received: u64,
    pub size: Option<u64>,
    pub chunkable: Option<bool>,
    pub chunks: Vec<Chunk>,
    pub phase: Phase,
    pub headers: HashMap<String, String>,
    pub had_errors: bool,
    pub split_done: bool,
    /// The partial file exists from an earlier run.
    pub resumed: bool,
    pub progress: Option<ProgressCallback>,
    pub reply: Option<ResultSender>,
}

impl Download {
    pub(crate) fn stored_chunks(&self) -> Vec<StoredChunk> {
        self.chunks.iter().map(Chunk::to_stored).collect()
    }

    /// Chunks that still have bytes to fetch, at their confirmed position.
    pub(crate) fn unfinished_chunks(&self) -> Vec<StoredChunk> {
        self.chunks
            .iter()
            .filter(|c| c.state != ChunkState::Finished && (c.confirmed_size > 0 || c.open_ended))
            .map(Chunk::to_stored)
            .collect()
    }

    pub(crate) fn running_workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.chunks.iter().filter_map(|c| c.worker_id)
    }

    pub(crate) fn has_running_workers(&self) -> bool {
        self.chunks.iter().any(|c| c.worker_id.is_some())
    }

    pub(crate) fn progress_snapshot(&self, with_chunks: bool) -> Progress {
        Progress {
            received: self.received,
            total: self.size,
            chunks: with_chunks.then(|| self.stored_chunks()),
            chunkable: self.chunkable,
            urls: self.sources.resolved_urls(),
            file_path: None,
        }
    }

    /// Path the finished file ends up at.
    pub(crate) fn destination(&self) -> &PathBuf {
        self.final_path.as_ref().unwrap_or(&self.temp_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_moves_window() {
        let mut c = Chunk::new(100, 50, 0);
        c.advance(20);
        assert_eq!((c.offset, c.size, c.received), (120, 30, 20));
        assert_eq!(c.span(), (100, 150));
        c.confirm(100, 10);
        assert_eq!(
            (c.confirmed_offset, c.confirmed_size, c.confirmed_received),
            (110, 40, 10)
        );
        assert!(c.confirmed_offset + c.confirmed_received <= c.offset + c.received);
    }

    #[test]
    fn reset_returns_to_confirmed_position() {
        let mut c = Chunk::new(0, 100, 0);
        c.state = ChunkState::Running;
        c.worker_id = Some(3);
        c.advance(60);
        c.confirm(0, 40);
        c.reset_to_confirmed();
        assert_eq!((c.offset, c.size, c.received), (40, 60, 40));
        assert_eq!(c.state, ChunkState::Init);
        assert_eq!(c.worker_id, None);
        assert_eq!(c.span(), (0, 100));
    }

    #[test]
    fn rewind_starts_over() {
        let mut c = Chunk::new(0, 100, 0);
        c.advance(70);
        c.confirm(0, 70);
        c.rewind();
        assert_eq!((c.offset, c.size, c.received), (0, 100, 0));
        assert_eq!(c.to_stored().received, 0);
    }

    #[test]
    fn set_end_adjusts_both_windows() {
        let mut c = Chunk::new(0, 1024, 0);
        c.advance(10);
        c.confirm(0, 5);
        c.set_end(500);
        assert_eq!(c.size, 490);
        assert_eq!(c.confirmed_size, 495);
        assert_eq!(c.span(), (0, 500));
    }

    #[test]
    fn stored_chunk_uses_confirmed_values() {
        let mut c = Chunk::new(900, 100, 0);
        c.advance(50);
        c.confirm(900, 30);
        let stored = c.to_stored();
        assert_eq!(stored.offset, 930);
        assert_eq!(stored.size, 70);
        assert_eq!(stored.received, 30);
    }
}
