//! Writer thread: the only code that touches the descriptor.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

use super::prealloc;

pub(super) enum Op {
    Write {
        offset: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<io::Result<bool>>,
    },
    SetTotalSize {
        size: u64,
    },
    Close {
        reply: oneshot::Sender<io::Result<()>>,
    },
}

/// Apply operations in arrival order until `Close` or until every handle is gone.
pub(super) fn run(
    file: File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Op>,
    sync_interval: u64,
) {
    let mut since_sync: u64 = 0;
    while let Some(op) = rx.blocking_recv() {
        match op {
            Op::Write {
                offset,
                data,
                reply,
            } => {
                let result = write_all_at(&file, offset, &data).and_then(|()| {
                    since_sync += data.len() as u64;
                    if since_sync >= sync_interval {
                        since_sync = 0;
                        file.sync_data()?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                });
                if let Err(e) = &result {
                    tracing::warn!(path = %path.display(), offset, "write failed: {}", e);
                }
                let _ = reply.send(result);
            }
            Op::SetTotalSize { size } => {
                if let Err(e) = prealloc::resize(&file, size) {
                    tracing::warn!(path = %path.display(), size, "could not size file: {}", e);
                }
            }
            Op::Close { reply } => {
                let result = file.sync_all();
                drop(file);
                tracing::debug!(path = %path.display(), "file assembler closed");
                let _ = reply.send(result);
                return;
            }
        }
    }
    if let Err(e) = file.sync_all() {
        tracing::warn!(path = %path.display(), "final sync failed: {}", e);
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)
}
