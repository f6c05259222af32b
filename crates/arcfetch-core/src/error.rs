//! Tagged download error.
//!
//! Every failure that can reach a caller is a `DownloadError`; `kind()` returns
//! the tag callers branch on instead of matching on variants directly.

use std::path::PathBuf;
use thiserror::Error;

use crate::manager::DownloadId;

/// Error-kind tag carried alongside every `DownloadError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure (connect, DNS, reset, stall, 5xx/429). Retried per chunk.
    Network,
    /// Non-retryable HTTP status (4xx other than 408/429).
    Http,
    /// The server answered with an HTML page instead of the payload.
    Html,
    /// Stopped on request. Not an error for reporting purposes.
    UserCanceled,
    /// Disk full, permission denied, write/rename failures.
    Disk,
    /// The file already exists and the redownload mode forbids a new copy.
    AlreadyDownloaded,
    /// Manager misconfiguration or invalid request.
    Config,
    /// No fetchable URL could be produced from the download's sources.
    Resolve,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network)
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u32 },

    #[error("server returned an HTML page instead of a file: {url}")]
    DownloadIsHtml { url: String },

    #[error("download canceled")]
    UserCanceled,

    #[error("disk error on {}: {source}", path.display())]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chunks of {} cover {covered} of {size} bytes", path.display())]
    IncompleteFile {
        path: PathBuf,
        covered: u64,
        size: u64,
    },

    #[error("file already downloaded: {file_name}")]
    AlreadyDownloaded { file_name: String, path: PathBuf },

    #[error("download manager has no worker slots")]
    NoWorkersAvailable,

    #[error("no download urls")]
    NoUrls,

    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("no unfinished chunks to resume")]
    NoUnfinishedChunks,

    #[error("failed to resolve {url}: {message}")]
    Resolve { url: String, message: String },

    #[error("unknown download {0}")]
    UnknownDownload(DownloadId),

    #[error("download {0} is already queued")]
    DuplicateDownload(DownloadId),

    #[error("download manager has shut down")]
    ManagerShutdown,
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Network { .. } => ErrorKind::Network,
            DownloadError::Http { status, .. } => {
                if is_transient_status(*status) {
                    ErrorKind::Network
                } else {
                    ErrorKind::Http
                }
            }
            DownloadError::DownloadIsHtml { .. } => ErrorKind::Html,
            DownloadError::UserCanceled => ErrorKind::UserCanceled,
            DownloadError::Disk { .. } | DownloadError::IncompleteFile { .. } => ErrorKind::Disk,
            DownloadError::AlreadyDownloaded { .. } => ErrorKind::AlreadyDownloaded,
            DownloadError::NoWorkersAvailable
            | DownloadError::NoUrls
            | DownloadError::InvalidUrl { .. }
            | DownloadError::NoUnfinishedChunks
            | DownloadError::UnknownDownload(_)
            | DownloadError::DuplicateDownload(_)
            | DownloadError::ManagerShutdown => ErrorKind::Config,
            DownloadError::Resolve { .. } => ErrorKind::Resolve,
        }
    }

    /// False for outcomes callers should not surface as failures.
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::UserCanceled | ErrorKind::AlreadyDownloaded
        )
    }

    pub(crate) fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Disk {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn network(url: impl Into<String>, message: impl ToString) -> Self {
        DownloadError::Network {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

/// Statuses worth another attempt: timeouts, throttling and server errors.
pub(crate) fn is_transient_status(status: u32) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}
