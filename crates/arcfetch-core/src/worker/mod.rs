//! One ranged HTTP request for one chunk.
//!
//! A worker runs a blocking curl transfer on tokio's blocking pool, hands
//! buffered bytes to a caller-supplied [`DataSink`], and reports what happens
//! as [`WorkerEvent`]s on a channel. Every worker reports exactly one
//! `Finished`, including after cancellation, so the slot it occupies is
//! always reclaimed.

mod response;
mod transfer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::DownloadError;

pub use response::{parse_content_range, ContentRange, ResponseInfo};

pub type WorkerId = u64;

/// Destination for the bytes a worker receives.
pub trait DataSink: Send + 'static {
    /// Persist `data` at absolute file `offset`. Returns true when the write
    /// was followed by an fsync.
    fn write(&mut self, offset: u64, data: Vec<u8>) -> Result<bool, DownloadError>;
}

/// Transport settings shared by all workers of a manager.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub user_agent: String,
    pub max_redirects: u32,
    pub connect_timeout: Duration,
    /// No data for this long counts as a stall.
    pub stall_timeout: Duration,
    /// Reconnects a worker performs by itself after stalls.
    pub max_stall_resets: u32,
    /// Bytes gathered before a write to the sink.
    pub write_buffer_bytes: usize,
    pub max_recv_speed: Option<u64>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            user_agent: crate::config::default_user_agent(),
            max_redirects: 5,
            connect_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(15),
            max_stall_resets: 2,
            write_buffer_bytes: 256 * 1024,
            max_recv_speed: None,
        }
    }
}

/// What to fetch.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub id: WorkerId,
    pub url: String,
    pub offset: u64,
    /// Bytes to request from `offset`; `None` reads to the end of the resource.
    pub size: Option<u64>,
    /// When false the request carries no `Range` header (whole, unchunked file).
    pub ranged: bool,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<String>,
    pub referer: Option<String>,
    pub settings: TransferSettings,
}

/// Range for `[start, end)`; open-ended when `end` is unknown.
pub(crate) fn range_spec(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) if end > start => format!("{}-{}", start, end - 1),
        _ => format!("{}-", start),
    }
}

/// How a worker's request ended. The manager decides what it means for the chunk.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// The stream ended without a transport error (possibly short).
    Completed,
    /// The connection dropped after data had arrived.
    Interrupted(DownloadError),
    /// The request failed.
    Failed(DownloadError),
    /// Stopped through its cancel flag.
    Canceled,
}

#[derive(Debug)]
pub enum WorkerEvent {
    /// Final response headers, sent once before any data.
    Response(ResponseInfo),
    /// Bytes received from the network (not yet on disk).
    Data { offset: u64, len: u64 },
    /// Bytes handed to the sink.
    Written { offset: u64, len: u64, synced: bool },
    Finished(WorkerOutcome),
}

#[derive(Debug)]
pub struct WorkerMessage {
    pub worker_id: WorkerId,
    pub event: WorkerEvent,
}

/// Sends events for one worker and guarantees a `Finished` is delivered.
pub(crate) struct EventEmitter {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    finished: bool,
}

impl EventEmitter {
    pub(crate) fn new(id: WorkerId, tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            id,
            tx,
            finished: false,
        }
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(WorkerMessage {
            worker_id: self.id,
            event,
        });
    }

    pub(crate) fn finish(mut self, outcome: WorkerOutcome) {
        self.finished = true;
        self.emit(WorkerEvent::Finished(outcome));
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        if !self.finished {
            self.emit(WorkerEvent::Finished(WorkerOutcome::Failed(
                DownloadError::network("", "worker exited unexpectedly"),
            )));
        }
    }
}

/// Cancel flag shared with a running worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Run `job` to completion on the blocking pool.
pub(crate) async fn run<S: DataSink>(job: WorkerJob, sink: S, cancel: CancelToken, emitter: EventEmitter) {
    let id = job.id;
    let joined = tokio::task::spawn_blocking(move || {
        let outcome = transfer::perform(&job, sink, &cancel, &emitter);
        emitter.finish(outcome);
    })
    .await;
    if let Err(e) = joined {
        // The emitter was dropped with the panicking closure and already
        // reported the worker as finished.
        tracing::error!(worker = id, "worker task failed: {}", e);
    }
}
