// File: registry/src/instance.rs
//! Persisted identity of one managed node deployment
//!
//! An instance lives in `nodes/<name>-<tag>/` and consists of a `state.json`
//! payload plus an empty `.lock` marker used for advisory locking.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::errors::{InstanceDefect, IoContext, LockError, RegistryError, Result};
use crate::fs::Fs;
use crate::locker::{FileLock, Locker};

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = ".lock";

/// Directory name of an instance within `nodes/`
pub fn instance_id(name: &str, tag: &str) -> String {
    format!("{}-{}", name, tag)
}

#[derive(Clone)]
struct Capabilities {
    fs: Arc<dyn Fs>,
    locker: Arc<dyn Locker>,
}

#[derive(Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub url: String,
    pub version: String,
    pub profile: String,
    pub tag: String,
    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    caps: Option<Capabilities>,
    #[serde(skip)]
    lock: Option<Box<dyn FileLock>>,
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        version: impl Into<String>,
        profile: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            version: version.into(),
            profile: profile.into(),
            tag: tag.into(),
            path: PathBuf::new(),
            caps: None,
            lock: None,
        }
    }

    pub fn id(&self) -> String {
        instance_id(&self.name, &self.tag)
    }

    /// Root directory of the instance. Empty until the instance is initialized
    /// or read from disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check that every persisted field is set and that the id is usable as
    /// a directory name.
    pub fn validate(&self) -> std::result::Result<(), InstanceDefect> {
        let fields = [
            ("name", &self.name),
            ("url", &self.url),
            ("version", &self.version),
            ("profile", &self.profile),
            ("tag", &self.tag),
        ];
        for (field, value) in fields {
            if value.is_empty() {
                return Err(InstanceDefect::EmptyField(field));
            }
        }
        for (field, value) in [("name", &self.name), ("tag", &self.tag)] {
            if !is_path_safe(value) {
                return Err(InstanceDefect::UnsafeId(field));
            }
        }
        Ok(())
    }

    /// Write the lock marker and the state file into `path`. The state file
    /// is created exclusively and never overwritten.
    pub(crate) fn init(
        &mut self,
        path: &Path,
        fs: Arc<dyn Fs>,
        locker: Arc<dyn Locker>,
    ) -> Result<()> {
        self.validate().map_err(|defect| RegistryError::InvalidInstance {
            path: path.to_path_buf(),
            defect,
        })?;

        let lock_path = path.join(LOCK_FILE);
        fs.create(&lock_path).at(&lock_path)?;

        let state_path = path.join(STATE_FILE);
        let state = serde_json::to_vec(&self).map_err(RegistryError::Serialize)?;
        let mut file = fs.create_new(&state_path).at(&state_path)?;
        file.write_all(&state).at(&state_path)?;
        file.flush().at(&state_path)?;

        self.path = path.to_path_buf();
        self.caps = Some(Capabilities { fs, locker });
        self.lock = None;
        debug!("Initialized instance {} at {}", self.id(), path.display());
        Ok(())
    }

    /// Load and validate the instance stored in `path`
    pub(crate) fn read(path: &Path, fs: Arc<dyn Fs>, locker: Arc<dyn Locker>) -> Result<Self> {
        let state_path = path.join(STATE_FILE);
        let data = match fs.read(&state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::InvalidInstanceDir {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(RegistryError::io(state_path, e)),
        };

        let invalid = |defect| RegistryError::InvalidInstance {
            path: path.to_path_buf(),
            defect,
        };
        let mut instance: Instance =
            serde_json::from_slice(&data).map_err(|e| invalid(InstanceDefect::Malformed(e)))?;
        instance.validate().map_err(invalid)?;

        instance.path = path.to_path_buf();
        instance.caps = Some(Capabilities { fs, locker });
        Ok(instance)
    }

    fn lock_handle(&mut self) -> Result<&mut Box<dyn FileLock>> {
        let lock = match self.lock.take() {
            Some(lock) => lock,
            None => {
                let caps = self.caps.as_ref().ok_or_else(|| RegistryError::InvalidInstanceDir {
                    path: self.path.clone(),
                })?;
                caps.locker.lock_for(&self.path.join(LOCK_FILE))
            }
        };
        Ok(self.lock.insert(lock))
    }

    /// Block until this handle holds the instance lock
    pub fn lock(&mut self) -> Result<()> {
        self.lock_handle()?.lock()?;
        Ok(())
    }

    /// Take the instance lock if no other handle holds it
    pub fn try_lock(&mut self) -> Result<bool> {
        Ok(self.lock_handle()?.try_lock()?)
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

    /// Lock the instance and release it when the guard goes out of scope
    pub fn lock_guard(&mut self) -> Result<InstanceGuard<'_>> {
        self.lock()?;
        Ok(InstanceGuard { instance: self })
    }

    /// Persist the current field values. Requires this handle to hold the
    /// instance lock. The state file is replaced atomically.
    #[instrument(skip(self), fields(instance = %self.id()))]
    pub fn save(&mut self) -> Result<()> {
        if !self.is_locked() {
            return Err(LockError::NotLocked {
                path: self.path.join(LOCK_FILE),
            }
            .into());
        }
        self.validate().map_err(|defect| RegistryError::InvalidInstance {
            path: self.path.clone(),
            defect,
        })?;
        let caps = self.caps.clone().ok_or_else(|| RegistryError::InvalidInstanceDir {
            path: self.path.clone(),
        })?;

        let state = serde_json::to_vec(&self).map_err(RegistryError::Serialize)?;
        let state_path = self.path.join(STATE_FILE);
        let tmp_path = self
            .path
            .join(format!("{}.{}.tmp", STATE_FILE, uuid::Uuid::new_v4()));
        let written = caps.fs.write(&tmp_path, &state).at(&tmp_path);
        if let Err(e) = written.and_then(|_| caps.fs.rename(&tmp_path, &state_path).at(&state_path)) {
            let _ = caps.fs.remove_file(&tmp_path);
            return Err(e);
        }
        info!("Saved state for instance {}", self.id());
        Ok(())
    }
}

/// Keeps an instance locked for the guard's lifetime
pub struct InstanceGuard<'a> {
    instance: &'a mut Instance,
}

impl std::ops::Deref for InstanceGuard<'_> {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        self.instance
    }
}

impl std::ops::DerefMut for InstanceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Instance {
        self.instance
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.instance.unlock() {
            warn!("Failed to release lock for {}: {}", self.instance.id(), e);
        }
    }
}

/// True when `value` names a single entry inside its parent directory
pub(crate) fn is_path_safe(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("version", &self.version)
            .field("profile", &self.profile)
            .field("tag", &self.tag)
            .field("path", &self.path)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Clone for Instance {
    /// The clone shares path and capabilities but starts unlocked
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: self.url.clone(),
            version: self.version.clone(),
            profile: self.profile.clone(),
            tag: self.tag.clone(),
            path: self.path.clone(),
            caps: self.caps.clone(),
            lock: None,
        }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.url == other.url
            && self.version == other.version
            && self.profile == other.profile
            && self.tag == other.tag
    }
}

impl Eq for Instance {}
