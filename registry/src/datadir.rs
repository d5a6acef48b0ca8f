// File: registry/src/datadir.rs
//! The data directory: single source of truth for managed instances
//!
//! Layout under the root:
//!
//! ```text
//! nodes/<instanceId>/state.json
//! nodes/<instanceId>/.lock
//! temp/<id>/
//! backup/<id>.tar
//! monitoring/
//! plugin/<id>.tar
//! ```
//!
//! Creation of instances, temp dirs, backups and the monitoring stack uses
//! exclusive-create primitives. When two processes race on the same id
//! exactly one wins; the other gets the matching "already exists" error, or
//! for the monitoring stack a plain handle to the directory the winner made.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::backup::{self, Backup, BackupId, ARCHIVE_EXTENSION};
use crate::errors::{IoContext, RegistryError, Result};
use crate::fs::Fs;
use crate::instance::{is_path_safe, Instance, STATE_FILE};
use crate::locker::Locker;
use crate::monitoring_stack::MonitoringStack;

pub const NODES_DIR: &str = "nodes";
pub const TEMP_DIR: &str = "temp";
pub const BACKUP_DIR: &str = "backup";
pub const PLUGIN_DIR: &str = "plugin";
pub const MONITORING_DIR: &str = "monitoring";

/// Name of the data directory under the user data home
pub const DEFAULT_DIR_NAME: &str = ".node-registry";

#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
    fs: Arc<dyn Fs>,
    locker: Arc<dyn Locker>,
}

impl DataDir {
    pub fn new(path: impl AsRef<Path>, fs: Arc<dyn Fs>, locker: Arc<dyn Locker>) -> Result<Self> {
        let path = path.as_ref();
        let path = std::path::absolute(path).at(path)?;
        Ok(Self { path, fs, locker })
    }

    /// Open the data directory at `$XDG_DATA_HOME/.node-registry`, falling
    /// back to `$HOME/.local/share/.node-registry`. Created if missing.
    pub fn new_default(fs: Arc<dyn Fs>, locker: Arc<dyn Locker>) -> Result<Self> {
        let data_home = dirs::data_dir().ok_or_else(|| {
            RegistryError::io(
                DEFAULT_DIR_NAME,
                io::Error::new(io::ErrorKind::NotFound, "no user data directory available"),
            )
        })?;
        let path = data_home.join(DEFAULT_DIR_NAME);
        fs.create_dir_all(&path).at(&path)?;
        Self::new(path, fs, locker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    fn instance_dir(&self, instance_id: &str) -> Result<PathBuf> {
        Ok(self.path.join(NODES_DIR).join(checked_id(instance_id)?))
    }

    /// Parse the instance stored under `nodes/<instance_id>`
    pub fn instance(&self, instance_id: &str) -> Result<Instance> {
        let path = self.instance_dir(instance_id)?;
        match self.fs.dir_exists(&path) {
            Ok(true) => {}
            Ok(false) => {
                return Err(RegistryError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })
            }
            Err(e) => return Err(RegistryError::io(path, e)),
        }
        Instance::read(&path, self.fs.clone(), self.locker.clone())
    }

    /// Register a new instance. Fails with `InstanceAlreadyExists` if an
    /// instance with the same name and tag is present.
    #[instrument(skip(self, instance), fields(instance = %instance.id()))]
    pub fn init_instance(&self, instance: &mut Instance) -> Result<()> {
        let id = instance.id();
        let path = self.path.join(NODES_DIR).join(&id);
        instance
            .validate()
            .map_err(|defect| RegistryError::InvalidInstance {
                path: path.clone(),
                defect,
            })?;

        let nodes_dir = self.path.join(NODES_DIR);
        self.fs.create_dir_all(&nodes_dir).at(&nodes_dir)?;
        match self.fs.create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RegistryError::InstanceAlreadyExists { instance_id: id });
            }
            Err(e) => return Err(RegistryError::io(path, e)),
        }

        if let Err(e) = instance.init(&path, self.fs.clone(), self.locker.clone()) {
            if let Err(cleanup) = self.fs.remove_dir_all(&path) {
                warn!("Failed to clean up {} after failed init: {}", path.display(), cleanup);
            }
            return Err(e);
        }
        info!("Registered instance {}", id);
        Ok(())
    }

    /// True when `nodes/<instance_id>/state.json` is present. Lookup
    /// failures count as absent; use [`DataDir::instance_exists`] to see them.
    pub fn has_instance(&self, instance_id: &str) -> bool {
        match self.instance_exists(instance_id) {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Treating instance {} as absent: {}", instance_id, e);
                false
            }
        }
    }

    pub fn instance_exists(&self, instance_id: &str) -> Result<bool> {
        let state_path = self.instance_dir(instance_id)?.join(STATE_FILE);
        self.fs.exists(&state_path).at(&state_path)
    }

    pub fn instance_path(&self, instance_id: &str) -> Result<PathBuf> {
        let path = self.instance_dir(instance_id)?;
        match self.fs.metadata(&path) {
            Ok(_) => Ok(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RegistryError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    /// Delete the instance directory and everything in it
    #[instrument(skip(self))]
    pub fn remove_instance(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_dir(instance_id)?;
        let meta = match self.fs.metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RegistryError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })
            }
            Err(e) => return Err(RegistryError::io(path, e)),
        };
        if !meta.is_dir() {
            return Err(RegistryError::NotADirectory { path });
        }
        self.fs.remove_dir_all(&path).at(&path)?;
        info!("Removed instance {}", instance_id);
        Ok(())
    }

    /// All registered instances, ordered by id. Any unreadable instance
    /// fails the whole listing.
    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        let nodes_dir = self.path.join(NODES_DIR);
        if !self.fs.exists(&nodes_dir).at(&nodes_dir)? {
            return Ok(Vec::new());
        }
        let mut instances = Vec::new();
        for entry in self.fs.read_dir(&nodes_dir).at(&nodes_dir)? {
            if entry.is_dir() {
                instances.push(self.instance(entry.name())?);
            }
        }
        debug!("Listed {} instances", instances.len());
        Ok(instances)
    }

    fn temp_dir(&self, id: &str) -> Result<PathBuf> {
        Ok(self.path.join(TEMP_DIR).join(checked_id(id)?))
    }

    /// Create `temp/<id>` and return its path
    pub fn init_temp(&self, id: &str) -> Result<PathBuf> {
        let path = self.temp_dir(id)?;
        let temp_root = self.path.join(TEMP_DIR);
        self.fs.create_dir_all(&temp_root).at(&temp_root)?;
        match self.fs.create_dir(&path) {
            Ok(()) => {
                debug!("Created temp dir {}", path.display());
                Ok(path)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(RegistryError::TempDirAlreadyExists { id: id.to_string() })
            }
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    /// Remove `temp/<id>`. Removing an absent temp dir is a no-op.
    pub fn remove_temp(&self, id: &str) -> Result<()> {
        let path = self.temp_dir(id)?;
        match self.fs.remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    pub fn temp_path(&self, id: &str) -> Result<PathBuf> {
        let path = self.temp_dir(id)?;
        match self.fs.metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(RegistryError::TempIsNotDir { path }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RegistryError::TempDirDoesNotExist { id: id.to_string() })
            }
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    fn backup_path(&self, backup_id: &BackupId) -> Result<PathBuf> {
        checked_id(&backup_id.instance_id)?;
        Ok(self.path.join(BACKUP_DIR).join(backup_id.file_name()))
    }

    /// Seal a new, empty archive for `backup_id`
    #[instrument(skip(self), fields(backup = %backup_id))]
    pub fn init_backup(&self, backup_id: BackupId) -> Result<Backup> {
        let path = self.backup_path(&backup_id)?;
        let backup_dir = self.path.join(BACKUP_DIR);
        self.fs.create_dir_all(&backup_dir).at(&backup_dir)?;

        match backup::seal_empty(self.fs.as_ref(), &path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RegistryError::BackupAlreadyExists {
                    backup_id: backup_id.to_string(),
                });
            }
            Err(e) => return Err(RegistryError::io(path, e)),
        }
        info!("Initialized backup {}", backup_id);
        Ok(Backup::new(backup_id, path))
    }

    /// Archive the current contents of an instance directory into a new
    /// backup stamped with the current time
    #[instrument(skip(self))]
    pub fn backup_instance(&self, instance_id: &str) -> Result<Backup> {
        let instance_dir = self.instance_path(instance_id)?;
        let backup = self.init_backup(BackupId::now(instance_id))?;
        let prefix = Path::new(NODES_DIR).join(instance_id);
        if let Err(e) = backup::write_tree(self.fs.as_ref(), backup.path(), &instance_dir, &prefix) {
            let _ = self.fs.remove_file(backup.path());
            return Err(e);
        }
        info!("Archived instance {} into backup {}", instance_id, backup.id);
        Ok(backup)
    }

    pub fn has_backup(&self, backup_id: &BackupId) -> Result<bool> {
        let path = self.backup_path(backup_id)?;
        self.fs.exists(&path).at(&path)
    }

    pub fn backup(&self, backup_id: &BackupId) -> Result<Backup> {
        if !self.has_backup(backup_id)? {
            return Err(RegistryError::BackupNotFound {
                backup_id: backup_id.to_string(),
            });
        }
        Ok(Backup::new(backup_id.clone(), self.backup_path(backup_id)?))
    }

    /// Every sealed backup, ordered by id. Files that do not look like
    /// backups are skipped.
    pub fn list_backups(&self) -> Result<Vec<Backup>> {
        let backup_dir = self.path.join(BACKUP_DIR);
        if !self.fs.dir_exists(&backup_dir).at(&backup_dir)? {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in self.fs.read_dir(&backup_dir).at(&backup_dir)? {
            if entry.is_dir() {
                continue;
            }
            let Some(stem) = entry
                .name()
                .strip_suffix(ARCHIVE_EXTENSION)
                .and_then(|s| s.strip_suffix('.'))
            else {
                continue;
            };
            match stem.parse::<BackupId>() {
                Ok(id) => {
                    let path = backup_dir.join(entry.name());
                    backups.push(Backup::new(id, path));
                }
                Err(e) => debug!("Skipping {}: {}", entry.name(), e),
            }
        }
        backups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(backups)
    }

    pub fn remove_backup(&self, backup_id: &BackupId) -> Result<()> {
        let path = self.backup_path(backup_id)?;
        match self.fs.remove_file(&path) {
            Ok(()) => {
                info!("Removed backup {}", backup_id);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RegistryError::BackupNotFound {
                backup_id: backup_id.to_string(),
            }),
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    /// Handle to the monitoring stack, creating and initializing its
    /// directory on first use
    pub fn monitoring_stack(&self) -> Result<MonitoringStack> {
        self.monitoring_stack_with(|_| Ok(()))
    }

    /// Like [`DataDir::monitoring_stack`], additionally running `setup` once
    /// when the directory is created by this call. If initialization fails
    /// the directory is removed again so the next caller retries.
    pub fn monitoring_stack_with<F, E>(&self, setup: F) -> std::result::Result<MonitoringStack, E>
    where
        F: FnOnce(&MonitoringStack) -> std::result::Result<(), E>,
        E: From<RegistryError>,
    {
        let path = self.path.join(MONITORING_DIR);
        let stack = MonitoringStack::new(path.clone(), self.fs.clone(), self.locker.clone());

        self.fs
            .create_dir_all(&self.path)
            .at(&self.path)
            .map_err(E::from)?;
        match self.fs.create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Using existing monitoring stack at {}", path.display());
                return Ok(stack);
            }
            Err(e) => return Err(RegistryError::io(path, e).into()),
        }

        let initialized = stack.init().map_err(E::from).and_then(|_| setup(&stack));
        if let Err(e) = initialized {
            if let Err(cleanup) = self.fs.remove_dir_all(&path) {
                warn!("Failed to clean up {} after failed init: {}", path.display(), cleanup);
            }
            return Err(e);
        }
        Ok(stack)
    }

    #[instrument(skip(self))]
    pub fn remove_monitoring_stack(&self) -> Result<()> {
        let path = self.path.join(MONITORING_DIR);
        match self.fs.metadata(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RegistryError::MonitoringStackNotFound { path });
            }
            Err(e) => return Err(RegistryError::io(path, e)),
        }
        self.fs.remove_dir_all(&path).at(&path)?;
        info!("Removed monitoring stack at {}", path.display());
        Ok(())
    }

    fn plugin_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .path
            .join(PLUGIN_DIR)
            .join(format!("{}.{}", checked_id(id)?, ARCHIVE_EXTENSION)))
    }

    /// Store a plugin image build context. The reader is consumed; a copy
    /// failure is reported ahead of a failure to flush the stored file.
    pub fn save_plugin_image_context<R: Read>(&self, id: &str, mut context: R) -> Result<()> {
        let path = self.plugin_path(id)?;
        let plugin_dir = self.path.join(PLUGIN_DIR);
        self.fs.create_dir_all(&plugin_dir).at(&plugin_dir)?;

        let mut file = self.fs.create(&path).at(&path)?;
        let copied = io::copy(&mut context, &mut file);
        let flushed = file.flush();
        drop(context);

        let bytes = copied.at(&path)?;
        flushed.at(&path)?;
        debug!("Saved plugin context {} ({} bytes)", id, bytes);
        Ok(())
    }

    pub fn plugin_context(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.plugin_path(id)?;
        self.fs.open(&path).at(&path)
    }

    /// Delete a stored plugin context. Absent contexts are not an error.
    pub fn remove_plugin_context(&self, id: &str) -> Result<()> {
        let path = self.plugin_path(id)?;
        match self.fs.remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }
}

/// Ids become a single path component under their subtree
fn checked_id(id: &str) -> Result<&str> {
    if is_path_safe(id) {
        Ok(id)
    } else {
        Err(RegistryError::InvalidId { id: id.to_string() })
    }
}
