//! Test fixtures for the registry:
//! - Data directories on a temporary real filesystem or in memory
//! - Sample instances

#![allow(dead_code)]

use std::sync::Arc;

use registry::{DataDir, FlockLocker, Instance, MemFs, MemLocker, OsFs};
use tempfile::TempDir;

/// Data directory backed by the OS filesystem and `flock(2)`. The temporary
/// directory is removed when the fixture is dropped.
pub struct TestDataDir {
    pub temp: TempDir,
    pub datadir: DataDir,
}

impl TestDataDir {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let datadir = DataDir::new(temp.path().join("data"), Arc::new(OsFs), Arc::new(FlockLocker))
            .expect("Failed to open data dir");
        Self { temp, datadir }
    }

    /// A second handle on the same directory, as another process would have
    pub fn reopen(&self) -> DataDir {
        DataDir::new(self.datadir.path(), Arc::new(OsFs), Arc::new(FlockLocker))
            .expect("Failed to reopen data dir")
    }
}

pub fn mem_datadir() -> (MemFs, DataDir) {
    let fs = MemFs::new();
    let datadir = DataDir::new("/data", Arc::new(fs.clone()), Arc::new(MemLocker::new()))
        .expect("Failed to open in-memory data dir");
    (fs, datadir)
}

pub mod instances {
    use super::Instance;

    pub const NAME: &str = "mock-avs";
    pub const URL: &str = "https://github.com/example/mock-avs";
    pub const VERSION: &str = "v3.1.0";
    pub const PROFILE: &str = "option-returner";
    pub const TAG: &str = "default";
    pub const ID: &str = "mock-avs-default";

    pub fn sample() -> Instance {
        Instance::new(NAME, URL, VERSION, PROFILE, TAG)
    }

    pub fn tagged(tag: &str) -> Instance {
        Instance::new(NAME, URL, VERSION, PROFILE, tag)
    }
}
