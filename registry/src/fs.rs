// File: registry/src/fs.rs
//! Filesystem capability injected into the registry
//!
//! `OsFs` talks to the real disk, `MemFs` keeps a tree in memory so the
//! registry can be exercised deterministically in tests.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    kind: FileKind,
    len: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: String,
    kind: FileKind,
}

impl DirEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

/// The subset of filesystem operations the registry needs
pub trait Fs: Send + Sync + fmt::Debug {
    fn metadata(&self, path: &Path) -> io::Result<Metadata>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Create a single directory, failing with `AlreadyExists` if anything
    /// is already at `path`.
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Create or truncate a file
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Create a file, failing with `AlreadyExists` if it is present
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Immediate children of `path`, sorted by name
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    fn exists(&self, path: &Path) -> io::Result<bool> {
        match self.metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn dir_exists(&self, path: &Path) -> io::Result<bool> {
        match self.metadata(path) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut reader = self.open(path)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut writer = self.create(path)?;
        writer.write_all(data)?;
        writer.flush()
    }
}

/// The real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

/// File handle whose `flush` pushes data to stable storage
struct SyncedFile(File);

impl Write for SyncedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.sync_data()
    }
}

impl Fs for OsFs {
    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        let meta = fs::metadata(path)?;
        Ok(Metadata {
            kind: if meta.is_dir() {
                FileKind::Dir
            } else {
                FileKind::File
            },
            len: meta.len(),
        })
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(SyncedFile(File::create(path)?)))
    }

    fn create_new(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Box::new(SyncedFile(file)))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let kind = if entry.file_type()?.is_dir() {
                FileKind::Dir
            } else {
                FileKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[derive(Debug, Default)]
struct MemTree {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemTree {
    fn is_dir(&self, path: &Path) -> bool {
        is_root(path) || self.dirs.contains(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn ensure_parent(&self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !self.is_dir(parent) => Err(not_found(parent)),
            _ => Ok(()),
        }
    }
}

fn is_root(path: &Path) -> bool {
    path.as_os_str().is_empty() || path.parent().is_none()
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{}: file exists", path.display()),
    )
}

fn not_a_directory(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotADirectory,
        format!("{}: not a directory", path.display()),
    )
}

fn is_a_directory(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::IsADirectory,
        format!("{}: is a directory", path.display()),
    )
}

/// In-memory filesystem. Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    tree: Arc<Mutex<MemTree>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemFile {
    tree: Arc<Mutex<MemTree>>,
    path: PathBuf,
}

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut tree = self.tree.lock();
        let content = tree
            .files
            .get_mut(&self.path)
            .ok_or_else(|| not_found(&self.path))?;
        content.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemFs {
    fn new_file(&self, path: &Path, exclusive: bool) -> io::Result<Box<dyn Write + Send>> {
        let mut tree = self.tree.lock();
        tree.ensure_parent(path)?;
        if tree.is_dir(path) {
            return Err(is_a_directory(path));
        }
        if exclusive && tree.is_file(path) {
            return Err(already_exists(path));
        }
        tree.files.insert(path.to_path_buf(), Vec::new());
        Ok(Box::new(MemFile {
            tree: self.tree.clone(),
            path: path.to_path_buf(),
        }))
    }
}

impl Fs for MemFs {
    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        let tree = self.tree.lock();
        if tree.is_dir(path) {
            return Ok(Metadata {
                kind: FileKind::Dir,
                len: 0,
            });
        }
        tree.files
            .get(path)
            .map(|content| Metadata {
                kind: FileKind::File,
                len: content.len() as u64,
            })
            .ok_or_else(|| not_found(path))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock();
        let ancestors: Vec<&Path> = path.ancestors().filter(|p| !is_root(p)).collect();
        for dir in ancestors.into_iter().rev() {
            if tree.is_file(dir) {
                return Err(not_a_directory(dir));
            }
            tree.dirs.insert(dir.to_path_buf());
        }
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock();
        tree.ensure_parent(path)?;
        if tree.is_dir(path) || tree.is_file(path) {
            return Err(already_exists(path));
        }
        tree.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let tree = self.tree.lock();
        if tree.is_dir(path) {
            return Err(is_a_directory(path));
        }
        let content = tree.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(Cursor::new(content.clone())))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.new_file(path, false)
    }

    fn create_new(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.new_file(path, true)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock();
        tree.ensure_parent(to)?;
        if tree.is_dir(to) {
            return Err(is_a_directory(to));
        }
        if let Some(content) = tree.files.remove(from) {
            tree.files.insert(to.to_path_buf(), content);
            return Ok(());
        }
        if !tree.dirs.contains(from) {
            return Err(not_found(from));
        }

        let moved_dirs: Vec<PathBuf> = tree
            .dirs
            .iter()
            .filter(|d| d.starts_with(from))
            .cloned()
            .collect();
        for dir in moved_dirs {
            tree.dirs.remove(&dir);
            if let Ok(rest) = dir.strip_prefix(from) {
                tree.dirs.insert(to.join(rest));
            }
        }
        let moved_files: Vec<PathBuf> = tree
            .files
            .keys()
            .filter(|f| f.starts_with(from))
            .cloned()
            .collect();
        for file in moved_files {
            if let (Some(content), Ok(rest)) = (tree.files.remove(&file), file.strip_prefix(from)) {
                tree.files.insert(to.join(rest), content);
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if tree.is_dir(path) {
            return Err(is_a_directory(path));
        }
        tree.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if tree.is_file(path) {
            return Err(not_a_directory(path));
        }
        if !tree.is_dir(path) {
            return Err(not_found(path));
        }
        tree.dirs.retain(|d| !d.starts_with(path));
        tree.files.retain(|f, _| !f.starts_with(path));
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let tree = self.tree.lock();
        if tree.is_file(path) {
            return Err(not_a_directory(path));
        }
        if !tree.is_dir(path) {
            return Err(not_found(path));
        }

        let mut children: BTreeMap<String, FileKind> = BTreeMap::new();
        let dirs = tree.dirs.iter().map(|d| (d, FileKind::Dir));
        let files = tree.files.keys().map(|f| (f, FileKind::File));
        for (child, kind) in dirs.chain(files) {
            if child.parent() == Some(path) {
                if let Some(name) = child.file_name() {
                    children.insert(name.to_string_lossy().into_owned(), kind);
                }
            }
        }

        Ok(children
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }
}
