// File: registry/src/locker.rs
//! Advisory, path-keyed mutual exclusion
//!
//! The unit of concurrency is the OS process: several invocations may work
//! against the same data directory at once. `FlockLocker` uses `flock(2)` on
//! a zero-content marker file, `MemLocker` provides the same semantics inside
//! one process for tests.
//!
//! # Usage
//!
//! ```ignore
//! let mut lock = locker.lock_for(&instance_dir.join(".lock"));
//! lock.lock()?;
//! // mutate state...
//! lock.unlock()?;
//! ```

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::errors::LockError;

/// Factory for lock handles
pub trait Locker: Send + Sync + fmt::Debug {
    fn lock_for(&self, path: &Path) -> Box<dyn FileLock>;
}

/// A single lock handle. Two handles on the same path exclude each other.
pub trait FileLock: Send + Sync + fmt::Debug {
    /// Block until the lock is held. Re-locking a held handle succeeds.
    fn lock(&mut self) -> Result<(), LockError>;

    /// Take the lock if it is free. Returns `false` when held elsewhere.
    fn try_lock(&mut self) -> Result<bool, LockError>;

    /// Release the lock. Fails with `NotLocked` if this handle does not hold it.
    fn unlock(&mut self) -> Result<(), LockError>;

    fn is_locked(&self) -> bool;

    fn path(&self) -> &Path;
}

/// `flock(2)` based locker for cross-process exclusion
#[derive(Debug, Clone, Copy, Default)]
pub struct FlockLocker;

impl Locker for FlockLocker {
    fn lock_for(&self, path: &Path) -> Box<dyn FileLock> {
        Box::new(FlockFileLock {
            path: path.to_path_buf(),
            file: None,
        })
    }
}

/// Holds the open marker file while locked; closing it releases the lock.
#[derive(Debug)]
pub struct FlockFileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FlockFileLock {
    fn open_marker(&self) -> Result<File, LockError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })
    }

    fn errno(&self, errno: Errno) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source: std::io::Error::from(errno),
        }
    }
}

impl FileLock for FlockFileLock {
    fn lock(&mut self) -> Result<(), LockError> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = self.open_marker()?;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.errno(e)),
            }
        }
        debug!("Acquired lock {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    fn try_lock(&mut self) -> Result<bool, LockError> {
        if self.file.is_some() {
            return Ok(true);
        }
        let file = self.open_marker()?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                debug!("Acquired lock {}", self.path.display());
                self.file = Some(file);
                Ok(true)
            }
            Err(e) if e == Errno::EWOULDBLOCK => Ok(false),
            Err(e) => Err(self.errno(e)),
        }
    }

    fn unlock(&mut self) -> Result<(), LockError> {
        let file = self.file.take().ok_or_else(|| LockError::NotLocked {
            path: self.path.clone(),
        })?;
        flock(file.as_raw_fd(), FlockArg::Unlock).map_err(|e| self.errno(e))?;
        debug!("Released lock {}", self.path.display());
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

/// Process-local locker with the same exclusion rules as `FlockLocker`.
/// Clones share one lock table.
#[derive(Debug, Clone, Default)]
pub struct MemLocker {
    table: Arc<LockTable>,
}

impl MemLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for MemLocker {
    fn lock_for(&self, path: &Path) -> Box<dyn FileLock> {
        Box::new(MemFileLock {
            path: path.to_path_buf(),
            table: self.table.clone(),
            held: false,
        })
    }
}

#[derive(Debug)]
pub struct MemFileLock {
    path: PathBuf,
    table: Arc<LockTable>,
    held: bool,
}

impl FileLock for MemFileLock {
    fn lock(&mut self) -> Result<(), LockError> {
        if self.held {
            return Ok(());
        }
        let mut held = self.table.held.lock();
        while held.contains(&self.path) {
            self.table.released.wait(&mut held);
        }
        held.insert(self.path.clone());
        self.held = true;
        Ok(())
    }

    fn try_lock(&mut self) -> Result<bool, LockError> {
        if self.held {
            return Ok(true);
        }
        let mut held = self.table.held.lock();
        if held.contains(&self.path) {
            return Ok(false);
        }
        held.insert(self.path.clone());
        self.held = true;
        Ok(true)
    }

    fn unlock(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Err(LockError::NotLocked {
                path: self.path.clone(),
            });
        }
        self.table.held.lock().remove(&self.path);
        self.held = false;
        self.table.released.notify_all();
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.held
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MemFileLock {
    fn drop(&mut self) {
        if self.held {
            self.table.held.lock().remove(&self.path);
            self.table.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_mem_lock_excludes_second_handle() {
        let locker = MemLocker::new();
        let path = Path::new("/data/nodes/a/.lock");
        let mut first = locker.lock_for(path);
        let mut second = locker.lock_for(path);

        first.lock().unwrap();
        assert!(first.is_locked());
        assert!(!second.try_lock().unwrap());

        first.unlock().unwrap();
        assert!(second.try_lock().unwrap());
    }

    #[test]
    fn test_mem_lock_relock_is_idempotent() {
        let locker = MemLocker::new();
        let mut lock = locker.lock_for(Path::new("/x/.lock"));
        lock.lock().unwrap();
        lock.lock().unwrap();
        assert!(lock.try_lock().unwrap());
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let locker = MemLocker::new();
        let mut lock = locker.lock_for(Path::new("/x/.lock"));
        let err = lock.unlock().unwrap_err();
        assert!(matches!(err, LockError::NotLocked { .. }));

        lock.lock().unwrap();
        lock.unlock().unwrap();
        assert!(matches!(lock.unlock(), Err(LockError::NotLocked { .. })));
    }

    #[test]
    fn test_mem_lock_blocks_until_released() {
        let locker = MemLocker::new();
        let path = PathBuf::from("/data/.lock");
        let mut first = locker.lock_for(&path);
        first.lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_locker = locker.clone();
        let handle = thread::spawn(move || {
            let mut second = waiter_locker.lock_for(&path);
            second.lock().unwrap();
            tx.send(()).unwrap();
            second.unlock().unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        first.unlock().unwrap();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("waiter should acquire the lock after release");
        handle.join().unwrap();
    }

    #[test]
    fn test_dropping_mem_lock_releases_it() {
        let locker = MemLocker::new();
        let path = Path::new("/y/.lock");
        {
            let mut lock = locker.lock_for(path);
            lock.lock().unwrap();
        }
        assert!(locker.lock_for(path).try_lock().unwrap());
    }

    #[test]
    fn test_flock_excludes_second_handle() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join(".lock");
        let mut first = FlockLocker.lock_for(&path);
        let mut second = FlockLocker.lock_for(&path);

        first.lock().unwrap();
        assert!(path.exists());
        assert!(!second.try_lock().unwrap());

        first.unlock().unwrap();
        assert!(second.try_lock().unwrap());
        second.unlock().unwrap();
    }

    #[test]
    fn test_flock_unlock_without_lock_fails() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut lock = FlockLocker.lock_for(&temp_dir.path().join(".lock"));
        assert!(matches!(lock.unlock(), Err(LockError::NotLocked { .. })));
    }
}
