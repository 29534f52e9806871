//! Exclusive, directory-scoped lock serializing build steps that mutate the
//! same image.
//!
//! The lock is an `flock(2)` on a lock file. It is released when the
//! [`DirLock`] guard is dropped, including on early return through `?`.

use crate::error::{Error, IoContext, Result};
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    file: File,
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> std::io::Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    flock(file.as_raw_fd(), FlockArg::Unlock).map_err(std::io::Error::from)
}

impl DirLock {
    /// Takes the lock without waiting. Another holder yields
    /// [`Error::LockContention`].
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)
            .io_context(|| format!("failed to open lock file {}", lock_path.display()))?;

        if !try_flock_exclusive(&file)
            .io_context(|| format!("failed to lock {}", lock_path.display()))?
        {
            return Err(Error::LockContention(lock_path.display().to_string()));
        }
        debug!("Acquired lock {}", lock_path.display());

        Ok(Self {
            path: lock_path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases explicitly, reporting unlock failures that `Drop` would
    /// swallow.
    pub fn release(self) -> Result<()> {
        unlock(&self.file).io_context(|| format!("failed to unlock {}", self.path.display()))
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = unlock(&self.file);
        debug!("Released lock {}", self.path.display());
    }
}
