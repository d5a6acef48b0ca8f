// File: monitoring/src/lib.rs
pub mod config;
pub mod constants;
pub mod errors;
pub mod manager;
pub mod services;

pub use errors::{MonitoringError, Result};
pub use manager::MonitoringManager;
pub use services::{MonitoringService, ServiceApi, ServiceOptions, Target, TargetChanges};
