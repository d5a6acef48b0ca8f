// File: registry/src/backup.rs
//! Sealed tar archives of instance directories
//!
//! A backup is a single `backup/<id>.tar` file. The id combines the instance
//! id with the creation time, so the same instance can be archived many
//! times while each archive name stays unique.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::errors::{IoContext, RegistryError, Result};
use crate::fs::Fs;

pub const ARCHIVE_EXTENSION: &str = "tar";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackupId {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
}

impl BackupId {
    /// Timestamps are kept at second precision so the id survives a trip
    /// through its string form.
    pub fn new(instance_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let timestamp = DateTime::from_timestamp(timestamp.timestamp(), 0).unwrap_or(timestamp);
        Self {
            instance_id: instance_id.into(),
            timestamp,
        }
    }

    pub fn now(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, Utc::now())
    }

    pub(crate) fn file_name(&self) -> String {
        format!("{}.{}", self, ARCHIVE_EXTENSION)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.instance_id, self.timestamp.timestamp())
    }
}

impl FromStr for BackupId {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = |reason: &str| RegistryError::InvalidBackupId {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let (instance_id, secs) = value
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing timestamp suffix"))?;
        if instance_id.is_empty() {
            return Err(invalid("empty instance id"));
        }
        let secs: i64 = secs.parse().map_err(|_| invalid("timestamp is not a number"))?;
        let timestamp =
            DateTime::from_timestamp(secs, 0).ok_or_else(|| invalid("timestamp out of range"))?;
        Ok(Self {
            instance_id: instance_id.to_string(),
            timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub id: BackupId,
    path: PathBuf,
}

impl Backup {
    pub(crate) fn new(id: BackupId, path: PathBuf) -> Self {
        Self { id, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Paths stored in the archive, in archive order
    pub fn entries(&self, fs: &dyn Fs) -> Result<Vec<String>> {
        let reader = fs.open(&self.path).at(&self.path)?;
        let mut archive = tar::Archive::new(reader);
        let mut names = Vec::new();
        for entry in archive.entries().at(&self.path)? {
            let entry = entry.at(&self.path)?;
            let name = entry.path().at(&self.path)?.to_string_lossy().into_owned();
            names.push(name);
        }
        Ok(names)
    }

    pub fn size(&self, fs: &dyn Fs) -> Result<u64> {
        Ok(fs.metadata(&self.path).at(&self.path)?.len())
    }
}

/// Exclusively create `path` holding an empty, well-formed archive
pub(crate) fn seal_empty(fs: &dyn Fs, path: &Path) -> io::Result<()> {
    let file = fs.create_new(path)?;
    let mut builder = tar::Builder::new(file);
    builder.finish()?;
    builder.into_inner()?.flush()
}

/// Replace the archive at `path` with the contents of the `root` directory,
/// stored under `prefix`. Written to a sibling file first and renamed in.
pub(crate) fn write_tree(fs: &dyn Fs, path: &Path, root: &Path, prefix: &Path) -> Result<()> {
    let tmp_path = path.with_extension(format!("{}.tmp", ARCHIVE_EXTENSION));
    let result = build_tree_archive(fs, &tmp_path, root, prefix)
        .and_then(|_| fs.rename(&tmp_path, path).at(path));
    if result.is_err() {
        let _ = fs.remove_file(&tmp_path);
    }
    result
}

fn build_tree_archive(fs: &dyn Fs, tmp_path: &Path, root: &Path, prefix: &Path) -> Result<()> {
    let file = fs.create(tmp_path).at(tmp_path)?;
    let mut builder = tar::Builder::new(file);
    append_dir(fs, &mut builder, root, prefix)?;
    builder.finish().at(tmp_path)?;
    builder.into_inner().at(tmp_path)?.flush().at(tmp_path)?;
    Ok(())
}

fn append_dir<W: Write>(
    fs: &dyn Fs,
    builder: &mut tar::Builder<W>,
    dir: &Path,
    archive_dir: &Path,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    builder
        .append_data(&mut header, archive_dir, io::empty())
        .at(dir)?;

    for entry in fs.read_dir(dir).at(dir)? {
        let source = dir.join(entry.name());
        let target = archive_dir.join(entry.name());
        if entry.is_dir() {
            append_dir(fs, builder, &source, &target)?;
        } else {
            let data = fs.read(&source).at(&source)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder
                .append_data(&mut header, &target, data.as_slice())
                .at(&source)?;
            debug!("Archived {}", target.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;

    #[test]
    fn test_backup_id_string_form() {
        let timestamp = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let id = BackupId::new("mock-avs-default", timestamp);
        assert_eq!(id.to_string(), "mock-avs-default-1700000000");
        assert_eq!(id.file_name(), "mock-avs-default-1700000000.tar");

        let parsed: BackupId = "mock-avs-default-1700000000".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_backup_id_drops_sub_second_precision() {
        let timestamp = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let id = BackupId::new("node-a", timestamp);
        assert_eq!(id.timestamp.timestamp_subsec_nanos(), 0);
        assert_eq!(id.to_string().parse::<BackupId>().unwrap(), id);
    }

    #[test]
    fn test_backup_id_rejects_garbage() {
        assert!("no_timestamp".parse::<BackupId>().is_err());
        assert!("node-abc".parse::<BackupId>().is_err());
        assert!("-100".parse::<BackupId>().is_err());
    }

    #[test]
    fn test_seal_empty_is_exclusive_and_readable() {
        let fs = MemFs::new();
        fs.create_dir_all(Path::new("/data/backup")).unwrap();
        let path = Path::new("/data/backup/a-1.tar");

        seal_empty(&fs, path).unwrap();
        let err = seal_empty(&fs, path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let backup = Backup::new("a-1".parse().unwrap(), path.to_path_buf());
        assert!(backup.entries(&fs).unwrap().is_empty());
        assert_eq!(backup.size(&fs).unwrap(), 1024);
    }

    #[test]
    fn test_write_tree_archives_nested_files() {
        let fs = MemFs::new();
        fs.create_dir_all(Path::new("/data/backup")).unwrap();
        fs.create_dir_all(Path::new("/data/nodes/a-b/sub")).unwrap();
        fs.write(Path::new("/data/nodes/a-b/state.json"), b"{}").unwrap();
        fs.write(Path::new("/data/nodes/a-b/sub/file"), b"payload").unwrap();
        let path = Path::new("/data/backup/a-b-1.tar");
        seal_empty(&fs, path).unwrap();

        write_tree(&fs, path, Path::new("/data/nodes/a-b"), Path::new("nodes/a-b")).unwrap();

        let backup = Backup::new("a-b-1".parse().unwrap(), path.to_path_buf());
        let entries = backup.entries(&fs).unwrap();
        assert!(entries.contains(&"nodes/a-b/state.json".to_string()));
        assert!(entries.contains(&"nodes/a-b/sub/file".to_string()));
        assert!(!fs.exists(Path::new("/data/backup/a-b-1.tar.tmp")).unwrap());
    }
}
