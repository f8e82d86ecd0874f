use std::fs::{File, OpenOptions};

use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::layout::IndexLayout;

/// Exclusive process lock over one index directory (`P.lock`); guarantees
/// a single writing process
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn acquire(layout: &IndexLayout) -> Result<Self> {
        let lock_path = layout.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            use libc::{LOCK_EX, LOCK_NB, flock};

            let fd = file.as_raw_fd();
            // Non-blocking: a second process must fail fast
            if unsafe { flock(fd, LOCK_EX | LOCK_NB) } != 0 {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    format!("index at {:?} is locked by another process", lock_path),
                ));
            }
        }

        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            use libc::{LOCK_UN, flock};

            unsafe {
                flock(self.file.as_raw_fd(), LOCK_UN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("idx"));
        {
            let _lock = FileLock::acquire(&layout).unwrap();
        }
        // Re-acquire after drop must succeed
        let _lock = FileLock::acquire(&layout).unwrap();
    }
}
