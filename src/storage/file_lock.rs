use std::fs::{File, OpenOptions};
use std::path::Path;
use crate::core::error::{Error, ErrorKind, Result};

/// Advisory lock serializing catalog appends across processes.
///
/// Released when dropped.
pub struct FileLock {
    pub file: File,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_EX};

            let fd = file.as_raw_fd();
            unsafe {
                if flock(fd, LOCK_EX) != 0 {
                    return Err(Error::new(
                        ErrorKind::Io,
                        format!("failed to lock {}: {}", path.display(), std::io::Error::last_os_error()),
                    ));
                }
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
            use libc::{flock, LOCK_UN};

            let fd = self.file.as_raw_fd();
            unsafe {
                flock(fd, LOCK_UN);
            }
        }
    }
}
