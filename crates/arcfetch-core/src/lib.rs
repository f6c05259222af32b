pub mod config;
pub mod logging;

pub mod assembler;
pub mod checksum;
pub mod error;
pub mod manager;
pub mod observer;
pub mod resolver;
pub mod retry;
pub mod speed;
pub mod url_model;
pub mod worker;

pub use error::{DownloadError, ErrorKind};
pub use manager::{DownloadManager, DownloadRequest, ManagerConfig, PendingDownload, ResumeRequest};
