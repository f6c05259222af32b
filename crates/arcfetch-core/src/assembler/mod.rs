//! Serialized writes of byte ranges into one destination file.
//!
//! A `FileAssembler` owns the file descriptor through a dedicated writer
//! thread. Every operation travels over one channel, so writes from any
//! number of workers are applied one after another without a lock around the
//! descriptor. Writes target disjoint ranges; their order does not matter.

mod prealloc;
mod writer;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use writer::Op;

/// Default cumulative write volume between fsyncs.
pub const DEFAULT_SYNC_INTERVAL: u64 = 1024 * 1024;

/// Handle to the writer of one download file. Cheap to clone; all clones
/// feed the same queue.
#[derive(Clone)]
pub struct FileAssembler {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<Op>,
    path: PathBuf,
    closed: AtomicBool,
}

impl FileAssembler {
    /// Create (or truncate) `path` and start its writer.
    pub fn create(path: &Path, sync_interval: u64) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::spawn(file, path, sync_interval)
    }

    /// Open an existing partial file for resume (no truncation).
    pub fn open_existing(path: &Path, sync_interval: u64) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Self::spawn(file, path, sync_interval)
    }

    fn spawn(file: File, path: &Path, sync_interval: u64) -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread_path = path.to_path_buf();
        std::thread::Builder::new()
            .name("arcfetch-assembler".into())
            .spawn(move || writer::run(file, thread_path, rx, sync_interval.max(1)))?;
        tracing::debug!(path = %path.display(), "file assembler opened");
        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                path: path.to_path_buf(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue `data` for writing at `offset`. Resolves to true when this write
    /// pushed the cumulative volume past the sync interval and was fsynced.
    pub async fn add_chunk(&self, offset: u64, data: Vec<u8>) -> io::Result<bool> {
        let reply = self.send_write(offset, data)?;
        reply.await.map_err(|_| closed_error())?
    }

    /// Blocking variant of [`add_chunk`](Self::add_chunk) for worker threads.
    /// Must not be called from within an async context.
    pub fn add_chunk_blocking(&self, offset: u64, data: Vec<u8>) -> io::Result<bool> {
        let reply = self.send_write(offset, data)?;
        reply.blocking_recv().map_err(|_| closed_error())?
    }

    fn send_write(
        &self,
        offset: u64,
        data: Vec<u8>,
    ) -> io::Result<oneshot::Receiver<io::Result<bool>>> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Op::Write {
                offset,
                data,
                reply,
            })
            .map_err(|_| closed_error())?;
        Ok(rx)
    }

    /// Record the expected final size. The file is preallocated (or truncated)
    /// to it by the writer; failures there are logged, not returned.
    pub fn set_total_size(&self, size: u64) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.inner
            .tx
            .send(Op::SetTotalSize { size })
            .map_err(|_| closed_error())
    }

    /// Flush pending writes, sync and close the descriptor. Later calls are
    /// no-ops that return `Ok`.
    pub async fn close(&self) -> io::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        if self.inner.tx.send(Op::Close { reply }).is_err() {
            // Writer already gone: nothing left to flush.
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "file assembler is closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_land_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let asm = FileAssembler::create(&path, DEFAULT_SYNC_INTERVAL).unwrap();
        asm.set_total_size(20).unwrap();

        asm.add_chunk(10, b"bbbb".to_vec()).await.unwrap();
        asm.add_chunk(0, b"aaaa".to_vec()).await.unwrap();
        asm.add_chunk(4, b"cccc".to_vec()).await.unwrap();
        asm.close().await.unwrap();

        let buf = std::fs::read(&path).unwrap();
        assert_eq!(buf.len(), 20);
        assert_eq!(&buf[0..4], b"aaaa");
        assert_eq!(&buf[4..8], b"cccc");
        assert_eq!(&buf[10..14], b"bbbb");
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let asm = FileAssembler::create(&path, 4096).unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let asm = asm.clone();
            tasks.push(tokio::spawn(async move {
                let data = vec![b'a' + i; 1000];
                asm.add_chunk(u64::from(i) * 1000, data).await.unwrap()
            }));
        }
        let mut synced = 0;
        for t in tasks {
            if t.await.unwrap() {
                synced += 1;
            }
        }
        asm.close().await.unwrap();

        // 8000 bytes with a 4096-byte interval syncs exactly once per 4096.
        assert_eq!(synced, 1);
        let buf = std::fs::read(&path).unwrap();
        assert_eq!(buf.len(), 8000);
        for i in 0..8usize {
            assert!(buf[i * 1000..(i + 1) * 1000].iter().all(|&b| b == b'a' + i as u8));
        }
    }

    #[tokio::test]
    async fn sync_reported_every_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let asm = FileAssembler::create(&path, 100).unwrap();
        assert!(!asm.add_chunk(0, vec![1; 60]).await.unwrap());
        assert!(asm.add_chunk(60, vec![1; 60]).await.unwrap());
        assert!(!asm.add_chunk(120, vec![1; 10]).await.unwrap());
        asm.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let asm = FileAssembler::create(&path, DEFAULT_SYNC_INTERVAL).unwrap();
        asm.add_chunk(0, b"xyz".to_vec()).await.unwrap();
        asm.close().await.unwrap();
        asm.close().await.unwrap();
        assert!(asm.is_closed());

        let err = asm.add_chunk(3, b"late".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(std::fs::read(&path).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn open_existing_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"hello-------").unwrap();
        let asm = FileAssembler::open_existing(&path, DEFAULT_SYNC_INTERVAL).unwrap();
        asm.set_total_size(12).unwrap();
        asm.add_chunk(6, b"world!".to_vec()).await.unwrap();
        asm.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello-world!");
    }

    #[tokio::test]
    async fn set_total_size_truncates_longer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.bin");
        std::fs::write(&path, vec![7u8; 64]).unwrap();
        let asm = FileAssembler::open_existing(&path, DEFAULT_SYNC_INTERVAL).unwrap();
        asm.set_total_size(16).unwrap();
        asm.close().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
    }

    #[test]
    fn blocking_write_from_plain_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocking.bin");
        let asm = FileAssembler::create(&path, DEFAULT_SYNC_INTERVAL).unwrap();
        let worker = asm.clone();
        std::thread::spawn(move || worker.add_chunk_blocking(2, b"cd".to_vec()).unwrap())
            .join()
            .unwrap();
        asm.add_chunk_blocking(0, b"ab".to_vec()).unwrap();
        drop(asm);
        // Dropping every handle lets the writer flush and exit.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if std::fs::read(&path).unwrap() == b"abcd" {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "writer never flushed");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
