//! The task that owns the download queue.
//!
//! Commands from [`DownloadManager`](super::DownloadManager) handles, worker
//! events and results of background preparation all arrive on channels and
//! are applied to the [`Scheduler`] one at a time. The scheduler's actions
//! are carried out here; anything slow (name reservation, renames, closing
//! files) runs in spawned tasks that report back over the internal channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use super::naming::{remove_existing, unused_name, FileExistsPrompt, RedownloadMode};
use super::queue::{resume_chunks, unix_now, Action, Scheduler, Settlement};
use super::sink::AssemblerSink;
use super::types::{
    Chunk, Download, DownloadId, DownloadResult, Phase, Progress, ResultSender, StoredChunk,
};
use super::{DownloadRequest, ManagerConfig, ResumeRequest};
use crate::assembler::FileAssembler;
use crate::error::{DownloadError, ErrorKind};
use crate::resolver::{Sources, UrlResolver};
use crate::speed::{Clock, SpeedCallback};
use crate::url_model::name_template;
use crate::worker::{
    CancelToken, EventEmitter, WorkerEvent, WorkerId, WorkerJob, WorkerMessage, WorkerOutcome,
};

type PauseReply = oneshot::Sender<Result<Vec<StoredChunk>, DownloadError>>;
type CancelReply = oneshot::Sender<Result<(), DownloadError>>;

pub(crate) enum Command {
    Enqueue {
        request: DownloadRequest,
        reply: ResultSender,
    },
    Resume {
        request: ResumeRequest,
        reply: ResultSender,
    },
    Pause {
        id: DownloadId,
        reply: PauseReply,
    },
    Cancel {
        id: DownloadId,
        delete_file: bool,
        reply: CancelReply,
    },
    SetMaxWorkers(usize),
    SetDownloadPath(PathBuf),
    SetFileExistsPrompt(Arc<dyn FileExistsPrompt>),
}

enum Internal {
    Prepared(Box<Download>, FileAssembler),
    PrepareFailed { id: DownloadId },
    FinalName { id: DownloadId, path: Option<PathBuf> },
}

/// Pause or cancel that arrived while the download was still being prepared.
enum Deferred {
    Pause(PauseReply),
    Cancel { delete_file: bool, reply: CancelReply },
}

/// What a preparation task needs from the coordinator.
struct Preparation {
    dir: PathBuf,
    min_chunk_size: u64,
    prompt: Option<Arc<dyn FileExistsPrompt>>,
    resolver: UrlResolver,
}

pub(crate) struct Coordinator {
    config: ManagerConfig,
    scheduler: Scheduler,
    resolver: UrlResolver,
    prompt: Option<Arc<dyn FileExistsPrompt>>,
    assemblers: HashMap<DownloadId, FileAssembler>,
    cancels: HashMap<WorkerId, CancelToken>,
    preparing: HashMap<DownloadId, Vec<Deferred>>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events_tx: mpsc::UnboundedSender<WorkerMessage>,
    events_rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl Coordinator {
    pub(crate) fn new(
        config: ManagerConfig,
        resolver: UrlResolver,
        clock: Arc<dyn Clock>,
        commands: mpsc::UnboundedReceiver<Command>,
        speed: watch::Sender<f64>,
    ) -> Self {
        let on_speed: SpeedCallback = Box::new(move |rate: f64| {
            speed.send_replace(rate);
        });
        let scheduler = Scheduler::new(&config, clock, Some(on_speed));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            scheduler,
            resolver,
            prompt: None,
            assemblers: HashMap::new(),
            cancels: HashMap::new(),
            preparing: HashMap::new(),
            commands,
            commands_closed: false,
            internal_tx,
            internal_rx,
            events_tx,
            events_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                Some(message) = self.events_rx.recv() => {
                    if matches!(message.event, WorkerEvent::Finished(_)) {
                        self.cancels.remove(&message.worker_id);
                    }
                    let actions = self.scheduler.handle_event(message);
                    self.execute(actions);
                }
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("all manager handles dropped");
                        self.commands_closed = true;
                    }
                },
                _ = tick.tick() => {
                    let actions = self.scheduler.tick();
                    self.execute(actions);
                }
            }

            if self.commands_closed && self.scheduler.is_empty() && self.preparing.is_empty() {
                break;
            }
        }
        tracing::debug!("download manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { request, reply } => {
                if let Err(err) = self.check_new(&request.id) {
                    let _ = reply.send(Err(err));
                    return;
                }
                let id = request.id.clone();
                let prep = self.preparation(request.dest_dir.clone());
                self.spawn_preparation(id, reply, prepare_new(request, prep));
            }
            Command::Resume { request, reply } => {
                if let Err(err) = self.check_new(&request.id) {
                    let _ = reply.send(Err(err));
                    return;
                }
                let id = request.id.clone();
                let resolver = self.resolver.clone();
                self.spawn_preparation(id, reply, prepare_resume(request, resolver));
            }
            Command::Pause { id, reply } => self.pause(id, reply),
            Command::Cancel {
                id,
                delete_file,
                reply,
            } => self.cancel(id, delete_file, reply),
            Command::SetMaxWorkers(max_workers) => {
                let actions = self.scheduler.set_max_workers(max_workers);
                self.execute(actions);
            }
            Command::SetDownloadPath(path) => {
                tracing::debug!(path = %path.display(), "download path changed");
                self.config.download_dir = path;
            }
            Command::SetFileExistsPrompt(prompt) => self.prompt = Some(prompt),
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Prepared(download, assembler) => {
                let id = download.id.clone();
                let deferred = self.preparing.remove(&id).unwrap_or_default();
                self.assemblers.insert(id.clone(), assembler);
                let actions = self.scheduler.add(*download);
                self.execute(actions);
                for request in deferred {
                    match request {
                        Deferred::Pause(reply) => self.pause(id.clone(), reply),
                        Deferred::Cancel { delete_file, reply } => {
                            self.cancel(id.clone(), delete_file, reply)
                        }
                    }
                }
            }
            Internal::PrepareFailed { id } => {
                for request in self.preparing.remove(&id).unwrap_or_default() {
                    match request {
                        Deferred::Pause(reply) => {
                            let _ = reply.send(Err(DownloadError::UnknownDownload(id.clone())));
                        }
                        Deferred::Cancel { reply, .. } => {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
            }
            Internal::FinalName { id, path } => {
                let (known, actions) = self.scheduler.set_final_path(&id, path.clone());
                if !known {
                    if let Some(path) = path {
                        tokio::spawn(async move { remove_quietly(&path).await });
                    }
                }
                self.execute(actions);
            }
        }
    }

    fn check_new(&self, id: &str) -> Result<(), DownloadError> {
        if self.scheduler.max_workers() == 0 {
            return Err(DownloadError::NoWorkersAvailable);
        }
        if self.scheduler.contains(id) || self.preparing.contains_key(id) {
            return Err(DownloadError::DuplicateDownload(id.to_string()));
        }
        Ok(())
    }

    fn preparation(&self, dest_dir: Option<PathBuf>) -> Preparation {
        Preparation {
            dir: dest_dir.unwrap_or_else(|| self.config.download_dir.clone()),
            min_chunk_size: self.scheduler.min_chunk_size(),
            prompt: self.prompt.clone(),
            resolver: self.resolver.clone(),
        }
    }

    fn spawn_preparation<F>(&mut self, id: DownloadId, reply: ResultSender, prepare: F)
    where
        F: std::future::Future<Output = Result<Download, DownloadError>> + Send + 'static,
    {
        self.preparing.insert(id.clone(), Vec::new());
        let tx = self.internal_tx.clone();
        let sync_interval = self.config.fsync_interval_bytes;
        tokio::spawn(async move {
            let prepared = match prepare.await {
                Ok(download) => {
                    let path = download.temp_path.clone();
                    open_assembler(path, download.resumed, download.size, sync_interval)
                        .await
                        .map(|assembler| (download, assembler))
                }
                Err(err) => Err(err),
            };
            match prepared {
                Ok((mut download, assembler)) => {
                    download.reply = Some(reply);
                    let _ = tx.send(Internal::Prepared(Box::new(download), assembler));
                }
                Err(err) => {
                    tracing::info!(id = %id, "download not queued: {}", err);
                    let _ = reply.send(Err(err));
                    let _ = tx.send(Internal::PrepareFailed { id });
                }
            }
        });
    }

    fn pause(&mut self, id: DownloadId, reply: PauseReply) {
        if let Some(deferred) = self.preparing.get_mut(&id) {
            deferred.push(Deferred::Pause(reply));
            return;
        }
        match self.scheduler.pause(&id) {
            Some((chunks, actions)) => {
                self.execute(actions);
                let _ = reply.send(Ok(chunks));
            }
            None => {
                let _ = reply.send(Err(DownloadError::UnknownDownload(id)));
            }
        }
    }

    fn cancel(&mut self, id: DownloadId, delete_file: bool, reply: CancelReply) {
        if let Some(deferred) = self.preparing.get_mut(&id) {
            deferred.push(Deferred::Cancel { delete_file, reply });
            return;
        }
        match self.scheduler.cancel(&id, delete_file) {
            Some(actions) => {
                self.execute(actions);
                let _ = reply.send(Ok(()));
            }
            None => {
                let _ = reply.send(Err(DownloadError::UnknownDownload(id)));
            }
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Start {
                    download,
                    worker,
                    chunk,
                } => self.start_worker(&download, worker, chunk),
                Action::Stop { worker } => {
                    if let Some(cancel) = self.cancels.get(&worker) {
                        cancel.cancel();
                    }
                }
                Action::SetTotalSize { download, size } => {
                    if let Some(assembler) = self.assemblers.get(&download) {
                        if let Err(e) = assembler.set_total_size(size) {
                            tracing::warn!(id = %download, "failed to record file size: {}", e);
                        }
                    }
                }
                Action::ReserveFinalName {
                    download,
                    dir,
                    file_name,
                } => {
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let path = match unused_name(&dir, &file_name, RedownloadMode::Always, None).await {
                            Ok(path) => Some(path),
                            Err(e) => {
                                tracing::warn!(id = %download, "keeping queued name: {}", e);
                                None
                            }
                        };
                        let _ = tx.send(Internal::FinalName { id: download, path });
                    });
                }
                Action::Progress { callback, progress } => callback(&progress),
                Action::Settle {
                    download,
                    settlement,
                } => {
                    let assembler = self.assemblers.remove(&download.id);
                    tokio::spawn(settle(download, settlement, assembler));
                }
            }
        }
    }

    fn start_worker(&mut self, id: &str, worker: WorkerId, index: usize) {
        let emitter = EventEmitter::new(worker, self.events_tx.clone());
        let Some(download) = self.scheduler.download(id) else {
            emitter.finish(WorkerOutcome::Canceled);
            return;
        };
        let chunk = &download.chunks[index];
        let mut headers = download.options.headers.clone();
        headers.extend(chunk.extra_headers.iter().cloned());
        let mut cookies = download.options.cookies.clone();
        cookies.extend(chunk.extra_cookies.iter().cloned());
        let job = WorkerJob {
            id: worker,
            url: String::new(),
            offset: chunk.offset,
            size: (!chunk.open_ended).then_some(chunk.size),
            ranged: download.chunkable != Some(false),
            headers,
            cookies,
            referer: download.options.referer.clone(),
            settings: self.config.transfer_settings(self.scheduler.max_workers()),
        };
        let mirror = chunk.mirror_index;
        let sources = download.sources.clone();

        let Some(assembler) = self.assemblers.get(id).cloned() else {
            let closed = std::io::Error::new(std::io::ErrorKind::NotFound, "file assembler is gone");
            emitter.finish(WorkerOutcome::Failed(DownloadError::disk(&download.temp_path, closed)));
            return;
        };

        let cancel = CancelToken::new();
        self.cancels.insert(worker, cancel.clone());
        tracing::debug!(
            id = %id,
            worker,
            offset = job.offset,
            size = ?job.size,
            mirror,
            "starting worker"
        );
        tokio::spawn(async move {
            match sources.url_for(mirror).await {
                Ok(url) => {
                    let job = WorkerJob { url, ..job };
                    crate::worker::run(job, AssemblerSink::new(assembler), cancel, emitter).await;
                }
                Err(err) => emitter.finish(WorkerOutcome::Failed(err)),
            }
        });
    }
}

/// Open the download's file and start its writer off the runtime threads.
async fn open_assembler(
    path: PathBuf,
    resumed: bool,
    size: Option<u64>,
    sync_interval: u64,
) -> Result<FileAssembler, DownloadError> {
    let file_path = path.clone();
    let opened = tokio::task::spawn_blocking(move || -> std::io::Result<FileAssembler> {
        let assembler = if resumed {
            FileAssembler::open_existing(&path, sync_interval)?
        } else {
            FileAssembler::create(&path, sync_interval)?
        };
        if let Some(size) = size {
            assembler.set_total_size(size)?;
        }
        Ok(assembler)
    })
    .await;
    match opened {
        Ok(result) => result.map_err(|e| DownloadError::disk(&file_path, e)),
        Err(join) => Err(DownloadError::disk(
            &file_path,
            std::io::Error::new(std::io::ErrorKind::Other, join),
        )),
    }
}

/// Reserve a name for a new download and build its discovery chunk.
async fn prepare_new(request: DownloadRequest, prep: Preparation) -> Result<Download, DownloadError> {
    let DownloadRequest {
        id,
        urls,
        dest_dir: _,
        options,
        progress,
    } = request;
    let first = urls.first().ok_or(DownloadError::NoUrls)?;
    let template = name_template(options.file_name.as_deref(), first).ok_or_else(|| {
        DownloadError::InvalidUrl {
            url: first.clone(),
            message: "cannot derive a file name".into(),
        }
    })?;

    let dir = prep.dir;
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| DownloadError::disk(&dir, e))?;
    if options.redownload == RedownloadMode::Replace {
        remove_existing(&dir, &template).await?;
    }
    let temp_path = unused_name(&dir, &template, options.redownload, prep.prompt.as_deref()).await?;

    let sources = Arc::new(Sources::new(
        urls,
        template.clone(),
        options.name_hint.clone(),
        prep.resolver,
    ));
    Ok(Download {
        id,
        orig_name: template,
        temp_path,
        final_path: None,
        final_name_pending: false,
        rename_allowed: options.file_name.is_none(),
        sources,
        options,
        started_secs: unix_now(),
        started_at: Duration::ZERO,
        received: 0,
        size: None,
        chunkable: None,
        chunks: vec![Chunk::new(0, prep.min_chunk_size, 0)],
        phase: Phase::Queued,
        headers: HashMap::new(),
        had_errors: false,
        split_done: false,
        resumed: false,
        progress,
        reply: None,
    })
}

/// Rebuild a paused download from its persisted chunks.
async fn prepare_resume(request: ResumeRequest, resolver: UrlResolver) -> Result<Download, DownloadError> {
    let ResumeRequest {
        id,
        file_path,
        urls,
        mut received,
        size,
        started_secs,
        chunks: stored,
        progress,
        options,
    } = request;
    if urls.is_empty() {
        return Err(DownloadError::NoUrls);
    }
    let size = (size > 0).then_some(size);
    let (chunks, rediscover) = resume_chunks(&stored, size);
    if size.is_none() {
        received = 0;
    }
    if chunks.is_empty() {
        return Err(DownloadError::NoUnfinishedChunks);
    }
    tokio::fs::metadata(&file_path)
        .await
        .map_err(|e| DownloadError::disk(&file_path, e))?;

    let orig_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sources = Arc::new(Sources::new(
        urls,
        orig_name.clone(),
        options.name_hint.clone(),
        resolver,
    ));
    Ok(Download {
        id,
        orig_name,
        temp_path: file_path,
        final_path: None,
        final_name_pending: false,
        rename_allowed: received == 0,
        sources,
        options,
        started_secs,
        started_at: Duration::ZERO,
        received,
        size,
        chunkable: None,
        chunks,
        phase: Phase::Queued,
        headers: HashMap::new(),
        had_errors: false,
        split_done: !rediscover,
        resumed: true,
        progress,
        reply: None,
    })
}

/// Close the file, finalize or clean up, and answer the caller.
async fn settle(mut download: Box<Download>, settlement: Settlement, assembler: Option<FileAssembler>) {
    let closed = match &assembler {
        Some(assembler) => assembler
            .close()
            .await
            .map_err(|e| DownloadError::disk(assembler.path(), e)),
        None => Ok(()),
    };

    let result = match settlement {
        Settlement::Finished => match closed {
            Ok(()) => finalize(&download).await,
            Err(err) => Err(err),
        },
        Settlement::Paused => {
            discard_final_name(&download).await;
            Ok(DownloadResult {
                file_path: download.temp_path.clone(),
                headers: download.headers.clone(),
                unfinished_chunks: download.unfinished_chunks(),
                had_errors: download.had_errors,
                size: download.size.unwrap_or(0),
                meta_info: download.sources.meta().await,
            })
        }
        Settlement::Failed(err) => {
            if err.kind() == ErrorKind::Html {
                remove_quietly(&download.temp_path).await;
            }
            discard_final_name(&download).await;
            Err(err)
        }
        Settlement::Canceled { delete_file } => {
            if delete_file {
                remove_quietly(&download.temp_path).await;
            }
            discard_final_name(&download).await;
            Err(DownloadError::UserCanceled)
        }
    };

    match &result {
        Ok(r) if r.unfinished_chunks.is_empty() => {
            tracing::info!(id = %download.id, path = %r.file_path.display(), size = r.size, "download finished")
        }
        Ok(r) => tracing::info!(id = %download.id, chunks = r.unfinished_chunks.len(), "download paused"),
        Err(e) if e.is_reportable() => tracing::warn!(id = %download.id, "download failed: {}", e),
        Err(e) => tracing::info!(id = %download.id, "download stopped: {}", e),
    }
    if let Some(reply) = download.reply.take() {
        let _ = reply.send(result);
    }
}

async fn finalize(download: &Download) -> Result<DownloadResult, DownloadError> {
    let destination = download.destination().clone();
    if destination != download.temp_path {
        tokio::fs::rename(&download.temp_path, &destination)
            .await
            .map_err(|e| DownloadError::disk(&destination, e))?;
        tracing::debug!(
            from = %download.temp_path.display(),
            to = %destination.display(),
            "renamed to final name"
        );
    }
    let size = download.size.unwrap_or(download.received);
    if let Some(callback) = &download.progress {
        callback(&Progress {
            received: size,
            total: Some(size),
            chunks: None,
            chunkable: download.chunkable,
            urls: download.sources.resolved_urls(),
            file_path: Some(destination.clone()),
        });
    }
    Ok(DownloadResult {
        file_path: destination,
        headers: download.headers.clone(),
        unfinished_chunks: Vec::new(),
        had_errors: download.had_errors,
        size,
        meta_info: download.sources.meta().await,
    })
}

/// Drop a final name that was reserved but will not be used.
async fn discard_final_name(download: &Download) {
    if let Some(path) = &download.final_path {
        if path != &download.temp_path {
            remove_quietly(path).await;
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "failed to remove file: {}", e),
    }
}
