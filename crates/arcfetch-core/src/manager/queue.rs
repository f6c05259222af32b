//! Chunk bookkeeping and slot scheduling.
//!
//! The scheduler owns every queued download and all chunk state. It never
//! performs I/O: each entry point applies one input (a request, a worker
//! event, a clock tick) and returns the [`Action`]s the coordinator has to
//! carry out. Everything here runs on the coordinator task only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::types::{
    Chunk, ChunkState, Download, DownloadId, Phase, Progress, ProgressCallback, StopReason,
    StoredChunk,
};
use super::ManagerConfig;
use crate::error::DownloadError;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::speed::{Clock, SpeedCalculator, SpeedCallback};
use crate::url_model::{decoded_basename, sanitize_file_name};
use crate::worker::{ResponseInfo, WorkerEvent, WorkerId, WorkerMessage, WorkerOutcome};

/// Starving measurements before a worker is restarted.
const SLOW_WORKER_LIMIT: u32 = 15;
/// Slow workers are only restarted this long after the download started.
const SLOW_RESTART_WINDOW: Duration = Duration::from_secs(15 * 60);

pub(crate) enum Action {
    /// Run a worker for chunk `chunk` of `download`.
    Start {
        download: DownloadId,
        worker: WorkerId,
        chunk: usize,
    },
    Stop {
        worker: WorkerId,
    },
    SetTotalSize {
        download: DownloadId,
        size: u64,
    },
    /// Reserve `file_name` in `dir` as the download's final name.
    ReserveFinalName {
        download: DownloadId,
        dir: PathBuf,
        file_name: String,
    },
    Progress {
        callback: ProgressCallback,
        progress: Progress,
    },
    /// The download left the queue; finalize and answer the caller.
    Settle {
        download: Box<Download>,
        settlement: Settlement,
    },
}

#[derive(Debug)]
pub(crate) enum Settlement {
    Finished,
    Paused,
    Failed(DownloadError),
    Canceled { delete_file: bool },
}

/// What happens to a chunk whose worker reported `Finished`.
enum Next {
    /// The download is stopping; keep the chunk as it is.
    Park,
    Finish,
    /// Continue from the confirmed position right away.
    Resume,
    /// Continue on the next mirror without counting a restart.
    Reroute,
    Retry(DownloadError),
}

pub(crate) struct Scheduler {
    max_workers: usize,
    max_chunks: usize,
    min_chunk_size: u64,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    speed: SpeedCalculator,
    downloads: Vec<Download>,
    /// Running workers and the download they work for.
    busy: HashMap<WorkerId, DownloadId>,
    slow: HashMap<WorkerId, u32>,
    next_worker: WorkerId,
}

impl Scheduler {
    pub(crate) fn new(
        config: &ManagerConfig,
        clock: Arc<dyn Clock>,
        on_speed: Option<SpeedCallback>,
    ) -> Self {
        let mut speed = SpeedCalculator::new(config.speed_horizon_secs, clock.clone());
        if let Some(cb) = on_speed {
            speed = speed.with_callback(cb);
        }
        Self {
            max_workers: config.max_workers,
            max_chunks: config.max_chunks_per_download.max(1),
            min_chunk_size: config.min_chunk_size.max(1),
            retry: config.retry,
            clock,
            speed,
            downloads: Vec::new(),
            busy: HashMap::new(),
            slow: HashMap::new(),
            next_worker: 1,
        }
    }

    pub(crate) fn min_chunk_size(&self) -> u64 {
        self.min_chunk_size
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.downloads.iter().any(|d| d.id == id)
    }

    pub(crate) fn download(&self, id: &str) -> Option<&Download> {
        self.downloads.iter().find(|d| d.id == id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }

    pub(crate) fn busy_workers(&self) -> usize {
        self.busy.len()
    }

    pub(crate) fn set_max_workers(&mut self, max_workers: usize) -> Vec<Action> {
        tracing::debug!(max_workers, "worker limit changed");
        self.max_workers = max_workers;
        self.tick_queue()
    }

    /// Queue a prepared download.
    pub(crate) fn add(&mut self, mut download: Download) -> Vec<Action> {
        let now = self.clock.elapsed();
        download.started_at = if download.resumed {
            let age = unix_now().saturating_sub(download.started_secs);
            now.saturating_sub(Duration::from_secs(age))
        } else {
            now
        };
        tracing::info!(
            id = %download.id,
            path = %download.temp_path.display(),
            chunks = download.chunks.len(),
            "download queued"
        );
        let mut actions = Vec::new();
        if let Some(callback) = download.progress.clone() {
            let mut progress = download.progress_snapshot(true);
            progress.file_path = Some(download.temp_path.clone());
            actions.push(Action::Progress { callback, progress });
        }
        self.downloads.push(download);
        actions.extend(self.tick_queue());
        actions
    }

    /// Once-per-second housekeeping: move the speed window and start chunks
    /// whose backoff has expired.
    pub(crate) fn tick(&mut self) -> Vec<Action> {
        self.speed.move_horizon();
        self.tick_queue()
    }

    /// Hand free worker slots to `init` chunks, oldest download first.
    pub(crate) fn tick_queue(&mut self) -> Vec<Action> {
        let now = self.clock.elapsed();
        let mut free = self.max_workers.saturating_sub(self.busy.len());
        let mut actions = Vec::new();
        for download in &mut self.downloads {
            if free == 0 {
                break;
            }
            if !download.phase.is_active() {
                continue;
            }
            for (index, chunk) in download.chunks.iter_mut().enumerate() {
                if free == 0 {
                    break;
                }
                if chunk.state != ChunkState::Init || chunk.not_before.is_some_and(|t| t > now) {
                    continue;
                }
                let worker = self.next_worker;
                self.next_worker += 1;
                chunk.state = ChunkState::Running;
                chunk.worker_id = Some(worker);
                chunk.not_before = None;
                chunk.attempt_start = chunk.received;
                self.busy.insert(worker, download.id.clone());
                self.speed.init_counter(worker);
                if matches!(download.phase, Phase::Queued) {
                    download.phase = if download.chunkable.is_none() {
                        Phase::Discovery
                    } else {
                        Phase::Running
                    };
                }
                actions.push(Action::Start {
                    download: download.id.clone(),
                    worker,
                    chunk: index,
                });
                free -= 1;
            }
        }
        actions
    }

    pub(crate) fn handle_event(&mut self, message: WorkerMessage) -> Vec<Action> {
        let worker = message.worker_id;
        match message.event {
            WorkerEvent::Finished(outcome) => self.on_finished(worker, outcome),
            event => {
                let Some((d, c)) = self.locate(worker) else {
                    return Vec::new();
                };
                match event {
                    WorkerEvent::Response(info) => self.on_response(d, c, info),
                    WorkerEvent::Data { len, .. } => self.on_data(d, c, worker, len),
                    WorkerEvent::Written { offset, len, synced } => {
                        self.on_written(d, c, offset, len, synced)
                    }
                    WorkerEvent::Finished(_) => Vec::new(),
                }
            }
        }
    }

    /// Stop a download and keep its partial file. Returns the confirmed
    /// position of every unfinished chunk.
    pub(crate) fn pause(&mut self, id: &str) -> Option<(Vec<StoredChunk>, Vec<Action>)> {
        let index = self.position(id)?;
        let download = &mut self.downloads[index];
        if !download.phase.is_active() {
            return Some((download.unfinished_chunks(), Vec::new()));
        }
        tracing::info!(id = %id, "pausing download");
        download.phase = Phase::Pausing;
        for chunk in &mut download.chunks {
            if chunk.state == ChunkState::Init {
                chunk.state = ChunkState::Paused;
            }
        }
        let snapshot = download.unfinished_chunks();
        let mut actions: Vec<Action> = download
            .running_workers()
            .map(|worker| Action::Stop { worker })
            .collect();
        actions.extend(self.try_settle(index));
        Some((snapshot, actions))
    }

    /// Stop a download for good. Returns `None` for unknown ids.
    pub(crate) fn cancel(&mut self, id: &str, delete_file: bool) -> Option<Vec<Action>> {
        let index = self.position(id)?;
        let download = &mut self.downloads[index];
        tracing::info!(id = %id, delete_file, "canceling download");
        download.phase = Phase::Canceling { delete_file };
        for chunk in &mut download.chunks {
            if chunk.state == ChunkState::Init {
                chunk.state = ChunkState::Finished;
            }
        }
        let mut actions: Vec<Action> = download
            .running_workers()
            .map(|worker| Action::Stop { worker })
            .collect();
        actions.extend(self.try_settle(index));
        Some(actions)
    }

    /// Fail a download from outside a worker (e.g. its file could not be opened).
    pub(crate) fn fail(&mut self, id: &str, err: DownloadError) -> Vec<Action> {
        let Some(index) = self.position(id) else {
            return Vec::new();
        };
        let mut actions = self.fail_download(index, err);
        actions.extend(self.try_settle(index));
        actions.extend(self.tick_queue());
        actions
    }

    /// Result of a final name reservation. Returns false if the download is
    /// gone, in which case the reserved file is the caller's to remove.
    pub(crate) fn set_final_path(
        &mut self,
        id: &str,
        path: Option<PathBuf>,
    ) -> (bool, Vec<Action>) {
        let Some(index) = self.position(id) else {
            return (false, Vec::new());
        };
        let download = &mut self.downloads[index];
        download.final_name_pending = false;
        if let Some(path) = path {
            tracing::debug!(id = %id, path = %path.display(), "final name reserved");
            download.final_path = Some(path);
        }
        (true, self.try_settle(index).into_iter().collect())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.downloads.iter().position(|d| d.id == id)
    }

    fn locate(&self, worker: WorkerId) -> Option<(usize, usize)> {
        let id = self.busy.get(&worker)?;
        let d = self.position(id)?;
        let c = self.downloads[d]
            .chunks
            .iter()
            .position(|c| c.worker_id == Some(worker))?;
        Some((d, c))
    }

    fn on_response(&mut self, d: usize, c: usize, info: ResponseInfo) -> Vec<Action> {
        let min_chunk_size = self.min_chunk_size;
        let max_pieces = self.max_chunks.min(self.max_workers.max(1));
        let download = &mut self.downloads[d];
        if !download.phase.is_active() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        download.chunks[c].url = Some(info.url.clone());

        let first = matches!(download.phase, Phase::Discovery);
        if first {
            download.phase = Phase::Running;
            download.headers = info.headers.clone();
            download.chunkable = Some(info.chunkable);
            tracing::debug!(
                id = %download.id,
                status = info.status,
                size = ?info.total_size,
                chunkable = info.chunkable,
                "first response"
            );
            if let Some(action) = final_name_request(download, &info) {
                actions.push(action);
            }
        } else if info.chunkable {
            download.chunkable = Some(true);
        }

        match info.total_size {
            Some(total) => {
                if download.size != Some(total) {
                    download.size = Some(total);
                    actions.push(Action::SetTotalSize {
                        download: download.id.clone(),
                        size: total,
                    });
                }
                let chunk = &mut download.chunks[c];
                if info.chunkable {
                    let (_, end) = chunk.span();
                    if chunk.open_ended || end > total {
                        chunk.set_end(total);
                    }
                } else if first {
                    // The whole resource arrives in this response.
                    chunk.set_end(total);
                    download.split_done = true;
                }
            }
            None if first => {
                let chunk = &mut download.chunks[c];
                chunk.open_ended = true;
                chunk.size = 0;
                chunk.confirmed_size = 0;
                download.chunkable = Some(false);
                download.split_done = true;
                if info.status == 206 {
                    // The body stops at the requested range; ask again without one.
                    if let Some(worker) = chunk.worker_id.filter(|_| chunk.stop.is_none()) {
                        tracing::debug!(id = %download.id, worker, "total size unknown, refetching unranged");
                        chunk.stop = Some(StopReason::Unranged);
                        actions.push(Action::Stop { worker });
                    }
                }
            }
            None => {}
        }

        if first && info.chunkable && !download.split_done && download.chunks.len() == 1 {
            let (_, start) = download.chunks[0].span();
            if let Some(total) = download.size.filter(|&t| t > start) {
                fan_out(download, start, total, min_chunk_size, max_pieces);
            }
            download.split_done = true;
        }
        actions.extend(self.tick_queue());
        actions
    }

    fn on_data(&mut self, d: usize, c: usize, worker: WorkerId, len: u64) -> Vec<Action> {
        let now = self.clock.elapsed();
        let download = &mut self.downloads[d];
        let chunk = &mut download.chunks[c];
        chunk.advance(len);
        download.received += len;
        if download.size.is_some_and(|size| download.received > size) {
            download.size = Some(download.received);
        }

        let starving = self.speed.add_measure(worker, len);
        if !starving || !download.phase.is_active() || download.chunkable == Some(false) {
            return Vec::new();
        }
        let count = self.slow.entry(worker).or_insert(0);
        *count += 1;
        let chunk = &mut download.chunks[c];
        if *count > SLOW_WORKER_LIMIT
            && now.saturating_sub(download.started_at) < SLOW_RESTART_WINDOW
            && chunk.stop.is_none()
        {
            tracing::info!(
                id = %download.id,
                worker,
                offset = chunk.offset,
                "restarting slow worker"
            );
            chunk.stop = Some(StopReason::Restart);
            return vec![Action::Stop { worker }];
        }
        Vec::new()
    }

    fn on_written(&mut self, d: usize, c: usize, offset: u64, len: u64, synced: bool) -> Vec<Action> {
        let download = &mut self.downloads[d];
        download.chunks[c].confirm(offset, len);
        match download.progress.clone() {
            Some(callback) => vec![Action::Progress {
                callback,
                progress: download.progress_snapshot(synced),
            }],
            None => Vec::new(),
        }
    }

    fn on_finished(&mut self, worker: WorkerId, outcome: WorkerOutcome) -> Vec<Action> {
        let located = self.locate(worker);
        self.busy.remove(&worker);
        self.speed.stop_counter(worker);
        self.slow.remove(&worker);
        let Some((d, c)) = located else {
            return self.tick_queue();
        };

        let now = self.clock.elapsed();
        let download = &mut self.downloads[d];
        let chunk = &mut download.chunks[c];
        chunk.worker_id = None;
        let stop = chunk.stop.take();

        let next = if !download.phase.is_active() {
            Next::Park
        } else if chunk.is_complete() {
            Next::Finish
        } else if stop == Some(StopReason::Restart) {
            Next::Reroute
        } else if stop == Some(StopReason::Unranged) {
            Next::Resume
        } else {
            let progressed = chunk.received > chunk.attempt_start;
            match outcome {
                WorkerOutcome::Completed if chunk.open_ended => Next::Finish,
                WorkerOutcome::Completed | WorkerOutcome::Interrupted(_) if progressed => {
                    Next::Resume
                }
                WorkerOutcome::Completed => Next::Retry(DownloadError::network(
                    chunk.url.clone().unwrap_or_default(),
                    "connection closed before the chunk was complete",
                )),
                WorkerOutcome::Interrupted(err) | WorkerOutcome::Failed(err) => Next::Retry(err),
                WorkerOutcome::Canceled => Next::Resume,
            }
        };

        let mut actions = Vec::new();
        match next {
            Next::Park => {
                chunk.state = if chunk.is_complete() {
                    ChunkState::Finished
                } else {
                    ChunkState::Paused
                };
            }
            Next::Finish => {
                chunk.state = ChunkState::Finished;
                tracing::debug!(id = %download.id, worker, "chunk finished");
            }
            Next::Resume => {
                tracing::debug!(
                    id = %download.id,
                    worker,
                    offset = chunk.confirmed_offset,
                    remaining = chunk.confirmed_size,
                    "chunk ended early, resuming"
                );
                restart_chunk(download, c);
            }
            Next::Reroute => {
                download.chunks[c].mirror_index += 1;
                restart_chunk(download, c);
            }
            Next::Retry(err) => match self.retry.decide(chunk.restart_count, &err) {
                RetryDecision::RestartAfter(delay) => {
                    tracing::warn!(
                        id = %download.id,
                        worker,
                        restart = chunk.restart_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "chunk failed, restarting: {}",
                        err
                    );
                    chunk.restart_count += 1;
                    chunk.mirror_index += 1;
                    chunk.not_before = Some(now + delay);
                    download.had_errors = true;
                    restart_chunk(download, c);
                }
                RetryDecision::GiveUp => actions.extend(self.fail_download(d, err)),
            },
        }
        actions.extend(self.try_settle(d));
        actions.extend(self.tick_queue());
        actions
    }

    fn fail_download(&mut self, index: usize, err: DownloadError) -> Vec<Action> {
        let download = &mut self.downloads[index];
        if !download.phase.is_active() {
            return Vec::new();
        }
        tracing::warn!(id = %download.id, kind = ?err.kind(), "download failed: {}", err);
        for chunk in &mut download.chunks {
            if chunk.state == ChunkState::Init {
                chunk.state = ChunkState::Paused;
            }
        }
        download.phase = Phase::Failing(err);
        download
            .running_workers()
            .map(|worker| Action::Stop { worker })
            .collect()
    }

    /// Remove the download once nothing runs for it and it reached an end state.
    fn try_settle(&mut self, index: usize) -> Option<Action> {
        let download = &self.downloads[index];
        if download.has_running_workers() {
            return None;
        }
        let ready = match download.phase {
            Phase::Pausing | Phase::Canceling { .. } | Phase::Failing(_) => true,
            Phase::Queued | Phase::Discovery | Phase::Running => {
                !download.final_name_pending
                    && download
                        .chunks
                        .iter()
                        .all(|c| c.state == ChunkState::Finished)
            }
        };
        if !ready {
            return None;
        }
        let mut download = self.downloads.remove(index);
        let settlement = match std::mem::replace(&mut download.phase, Phase::Queued) {
            Phase::Pausing => Settlement::Paused,
            Phase::Canceling { delete_file } => Settlement::Canceled { delete_file },
            Phase::Failing(err) => Settlement::Failed(err),
            Phase::Queued | Phase::Discovery | Phase::Running => {
                let covered: u64 = download
                    .chunks
                    .iter()
                    .map(|c| {
                        let (start, end) = c.span();
                        end - start
                    })
                    .sum();
                let size = download.size.unwrap_or(0).max(download.received);
                if !download.chunks.iter().any(|c| c.open_ended) && covered != size {
                    tracing::error!(id = %download.id, covered, size, "chunks do not cover the file");
                    Settlement::Failed(DownloadError::IncompleteFile {
                        path: download.temp_path.clone(),
                        covered,
                        size,
                    })
                } else {
                    download.size = Some(size);
                    Settlement::Finished
                }
            }
        };
        tracing::debug!(id = %download.id, ?settlement, "download leaves the queue");
        Some(Action::Settle {
            download: Box::new(download),
            settlement,
        })
    }
}

/// Ask for a final name when the server announces a different one.
fn final_name_request(download: &mut Download, info: &ResponseInfo) -> Option<Action> {
    if !download.rename_allowed || download.final_path.is_some() || download.final_name_pending {
        return None;
    }
    let name = info
        .file_name
        .clone()
        .or_else(|| decoded_basename(&info.url))?;
    let sanitized = sanitize_file_name(&name);
    if sanitized.is_empty() || sanitized == sanitize_file_name(&download.orig_name) {
        return None;
    }
    let dir = download.temp_path.parent()?.to_path_buf();
    download.final_name_pending = true;
    Some(Action::ReserveFinalName {
        download: download.id.clone(),
        dir,
        file_name: name,
    })
}

/// Split `[start, total)` into near-equal chunks behind the discovery chunk.
fn fan_out(download: &mut Download, start: u64, total: u64, min_chunk_size: u64, max_pieces: usize) {
    let remaining = total - start;
    let count = remaining
        .div_ceil(min_chunk_size)
        .min(max_pieces as u64)
        .max(1);
    let base = remaining / count;
    let extra = remaining % count;
    let cookies = download.chunks[0].extra_cookies.clone();
    let headers = download.chunks[0].extra_headers.clone();

    let mut offset = start;
    for i in 0..count {
        let len = base + u64::from(i < extra);
        let mut chunk = Chunk::new(offset, len, 0);
        chunk.extra_cookies = cookies.clone();
        chunk.extra_headers = headers.clone();
        download.chunks.push(chunk);
        offset += len;
    }
    tracing::debug!(
        id = %download.id,
        pieces = count,
        piece_size = base,
        total,
        "downloading file in chunks"
    );
}

/// Chunks a paused download continues with, and whether its first response
/// still decides the split. With no known size nothing on disk can be
/// trusted, so the file starts over from offset 0.
pub(crate) fn resume_chunks(stored: &[StoredChunk], size: Option<u64>) -> (Vec<Chunk>, bool) {
    if size.is_some() {
        let chunks = stored
            .iter()
            .filter(|s| s.size > 0)
            .map(Chunk::from_stored)
            .collect();
        return (chunks, false);
    }
    let Some(first) = stored.first() else {
        return (Vec::new(), false);
    };
    if first.size == 0 {
        // A body without a length: fetch it whole again.
        let mut chunk = Chunk::new(0, 0, 0);
        chunk.url = first.url.clone();
        chunk.open_ended = true;
        return (vec![chunk], false);
    }
    // Paused before the first response arrived.
    let mut chunk = Chunk::new(0, first.offset + first.size, 0);
    chunk.url = first.url.clone();
    (vec![chunk], true)
}

/// Put a chunk back to `init`. Without range support the file starts over.
fn restart_chunk(download: &mut Download, index: usize) {
    let chunk = &mut download.chunks[index];
    if download.chunkable == Some(false) {
        chunk.rewind();
        download.received = 0;
    } else {
        let unconfirmed = chunk.received.saturating_sub(chunk.confirmed_received);
        download.received = download.received.saturating_sub(unconfirmed);
        chunk.reset_to_confirmed();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
