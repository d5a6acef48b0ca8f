// File: registry/src/monitoring_stack.rs
//! The `monitoring/` directory holding the monitoring services' config
//!
//! Services address their files relative to the stack root, e.g.
//! `prometheus/prometheus.yml`. Writes replace files atomically so a service
//! reloading concurrently never sees a half-written config.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{IoContext, LockError, Result};
use crate::fs::Fs;
use crate::instance::LOCK_FILE;
use crate::locker::{FileLock, Locker};

pub const DOTENV_FILE: &str = ".env";

pub struct MonitoringStack {
    path: PathBuf,
    fs: Arc<dyn Fs>,
    locker: Arc<dyn Locker>,
    lock: Option<Box<dyn FileLock>>,
}

impl MonitoringStack {
    pub(crate) fn new(path: PathBuf, fs: Arc<dyn Fs>, locker: Arc<dyn Locker>) -> Self {
        Self {
            path,
            fs,
            locker,
            lock: None,
        }
    }

    /// One-time initialization of a freshly created stack directory
    pub(crate) fn init(&self) -> Result<()> {
        let lock_path = self.path.join(LOCK_FILE);
        self.fs.create(&lock_path).at(&lock_path)?;
        info!("Initialized monitoring stack at {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    /// True once services have been set up and the dotenv file written
    pub fn installed(&self) -> Result<bool> {
        let dotenv = self.path.join(DOTENV_FILE);
        self.fs.exists(&dotenv).at(&dotenv)
    }

    pub fn read_file(&self, relative: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.path.join(relative);
        self.fs.read(&path).at(&path)
    }

    /// Replace `relative` with `data` through a temporary sibling and rename
    pub fn write_file(&self, relative: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let path = self.path.join(relative);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let result = self
            .fs
            .write(&tmp_path, data)
            .at(&tmp_path)
            .and_then(|_| self.fs.rename(&tmp_path, &path).at(&path));
        if result.is_err() {
            let _ = self.fs.remove_file(&tmp_path);
        }
        debug!("Wrote {} ({} bytes)", path.display(), data.len());
        result
    }

    pub fn create_dir(&self, relative: impl AsRef<Path>) -> Result<()> {
        let path = self.path.join(relative);
        self.fs.create_dir_all(&path).at(&path)
    }

    /// Persist service options as sorted `KEY=VALUE` lines
    pub fn write_dotenv(&self, env: &BTreeMap<String, String>) -> Result<()> {
        let content: String = env
            .iter()
            .map(|(key, value)| format!("{}={}\n", key, value))
            .collect();
        self.write_file(DOTENV_FILE, content.as_bytes())
    }

    pub fn read_dotenv(&self) -> Result<BTreeMap<String, String>> {
        let raw = self.read_file(DOTENV_FILE)?;
        let content = String::from_utf8_lossy(&raw);
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect())
    }

    fn lock_handle(&mut self) -> &mut Box<dyn FileLock> {
        let lock_path = self.path.join(LOCK_FILE);
        let locker = &self.locker;
        self.lock.get_or_insert_with(|| locker.lock_for(&lock_path))
    }

    pub fn lock(&mut self) -> Result<()> {
        self.lock_handle().lock()?;
        Ok(())
    }

    pub fn try_lock(&mut self) -> Result<bool> {
        Ok(self.lock_handle().try_lock()?)
    }

    pub fn unlock(&mut self) -> Result<()> {
        match self.lock.as_mut() {
            Some(lock) if lock.is_locked() => Ok(lock.unlock()?),
            _ => Err(LockError::NotLocked {
                path: self.path.join(LOCK_FILE),
            }
            .into()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(|lock| lock.is_locked())
    }

    /// Take the stack lock, returning a guard that releases it when dropped.
    /// Returns immediately if this handle already holds the lock.
    pub fn lock_guard(&mut self) -> Result<StackGuard<'_>> {
        self.lock()?;
        Ok(StackGuard { stack: self })
    }
}

/// Holds the monitoring stack lock until dropped
#[derive(Debug)]
pub struct StackGuard<'a> {
    stack: &'a mut MonitoringStack,
}

impl std::ops::Deref for StackGuard<'_> {
    type Target = MonitoringStack;

    fn deref(&self) -> &MonitoringStack {
        self.stack
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.stack.unlock() {
            warn!("Failed to release monitoring stack lock at {}: {}", self.stack.path.display(), e);
        }
    }
}

impl Clone for MonitoringStack {
    /// The clone addresses the same directory with its own, unlocked handle
    fn clone(&self) -> Self {
        Self::new(self.path.clone(), self.fs.clone(), self.locker.clone())
    }
}

impl fmt::Debug for MonitoringStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringStack")
            .field("path", &self.path)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl PartialEq for MonitoringStack {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}
