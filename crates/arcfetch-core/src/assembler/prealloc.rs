//! Size the destination file once the total is known.

use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Grow `file` to `size` with real block allocation where possible, or
/// truncate it when it is longer.
pub(super) fn resize(file: &File, size: u64) -> io::Result<()> {
    let current = file.metadata()?.len();
    if current > size {
        return file.set_len(size);
    }
    if current == size {
        return Ok(());
    }
    #[cfg(unix)]
    {
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_shrinks() {
        let f = tempfile::tempfile().unwrap();
        resize(&f, 4096).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 4096);
        resize(&f, 10).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 10);
        resize(&f, 10).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 10);
    }
}
