// File: registry/src/lib.rs
//! On-disk registry of node instances, backups, temporary build directories,
//! plugin contexts and the monitoring stack.
//!
//! All filesystem access goes through an injected [`fs::Fs`] and all locking
//! through an injected [`locker::Locker`], so the same code runs against the
//! real filesystem or fully in memory.

pub mod backup;
pub mod datadir;
pub mod errors;
pub mod fs;
pub mod instance;
pub mod locker;
pub mod monitoring_stack;

pub use backup::{Backup, BackupId};
pub use datadir::DataDir;
pub use errors::{InstanceDefect, LockError, RegistryError, Result};
pub use fs::{Fs, MemFs, OsFs};
pub use instance::{Instance, InstanceGuard};
pub use locker::{FileLock, FlockLocker, Locker, MemLocker};
pub use monitoring_stack::{MonitoringStack, StackGuard};
