//! OS advisory file locks with a bounded wait.
//!
//! The kernel releases these when the owning process exits, so a crashed
//! holder never leaves them behind. Lock files themselves are never deleted:
//! removing a path another process has locked would let a third process lock a
//! fresh inode under the same name.

use crate::core::error::BoardError;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::Path;
use std::time::{Duration, Instant};

pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Tries at least once, then polls until `timeout`. `Ok(None)` means the wait ran out.
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<Self>, BoardError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(BoardError::IoError)?;

        let started = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Some(Self { file })),
                Err(TryLockError::WouldBlock) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Ok(None);
                    }
                    std::thread::sleep(poll.min(timeout - elapsed));
                }
                Err(TryLockError::Error(e)) => return Err(BoardError::IoError(e)),
            }
        }
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
