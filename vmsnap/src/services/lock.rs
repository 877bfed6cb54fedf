//! Per-domain advisory lock
//!
//! Only one backup, merge or rotate run may touch a domain at a time. The
//! lock is an fs2 exclusive lock on `<lock_dir>/vmsnap-<domain>.lock`,
//! taken without blocking and released on drop.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::naming::LOCK_FILE_PREFIX;
use crate::errors::{BackupError, Result};

pub struct DomainLock {
    file: File,
    path: PathBuf,
}

impl DomainLock {
    pub fn lock_path(lock_dir: &Path, domain: &str) -> PathBuf {
        lock_dir.join(format!("{}{}.lock", LOCK_FILE_PREFIX, domain))
    }

    /// Takes the lock or fails with `Locked` when another run holds it.
    pub fn try_acquire(lock_dir: &Path, domain: &str) -> Result<Self> {
        std::fs::create_dir_all(lock_dir).map_err(BackupError::io(lock_dir))?;

        let path = Self::lock_path(lock_dir, domain);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(BackupError::io(&path))?;

        if file.try_lock_exclusive().is_err() {
            return Err(BackupError::Locked {
                domain: domain.to_string(),
                lock_path: path,
            });
        }

        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DomainLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
