use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use fs4::fs_std::FileExt;
use log::{debug, trace};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Exclusive advisory lock on a file, released when dropped.
///
/// Contention is handled by waiting: the lock is retried once per second until
/// it is acquired or the timeout elapses.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl FileLock {
    pub fn new(path: &Path) -> Result<Self, Error> {
        Self::with_timeout(path, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(path: &Path, timeout: Duration) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(true) => {
                    trace!("Locked {}", path.display());
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Ok(false) => {}
                Err(error)
                    if error.raw_os_error() == fs4::lock_contended_error().raw_os_error() => {}
                Err(error) => return Err(error.into()),
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }
            debug!("Lock {} is held elsewhere, retrying", path.display());
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            debug!("Failed to release lock {}: {}", self.path.display(), error);
        }
    }
}
