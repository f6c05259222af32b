use crate::assembler::FileAssembler;
use crate::error::DownloadError;
use crate::worker::DataSink;

/// Feeds a worker's buffers into the download's file assembler.
pub(crate) struct AssemblerSink {
    assembler: FileAssembler,
}

impl AssemblerSink {
    pub(crate) fn new(assembler: FileAssembler) -> Self {
        Self { assembler }
    }
}

impl DataSink for AssemblerSink {
    fn write(&mut self, offset: u64, data: Vec<u8>) -> Result<bool, DownloadError> {
        self.assembler
            .add_chunk_blocking(offset, data)
            .map_err(|e| DownloadError::disk(self.assembler.path(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::DEFAULT_SYNC_INTERVAL;

    #[test]
    fn write_failure_is_a_disk_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let asm = FileAssembler::create(&path, DEFAULT_SYNC_INTERVAL).unwrap();
        let mut sink = AssemblerSink::new(asm.clone());
        assert!(!sink.write(0, b"ab".to_vec()).unwrap());

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(asm.close()).unwrap();
        let err = sink.write(2, b"cd".to_vec()).unwrap_err();
        assert!(matches!(err, DownloadError::Disk { ref path, .. } if path.ends_with("f.bin")));
    }
}
