//! Test fixtures for the monitoring crate:
//! - Mock Prometheus reload endpoint
//! - Monitoring managers over a temporary data directory

#![allow(dead_code)]

pub mod mock_prometheus;

pub use mock_prometheus::MockPrometheusServer;

use monitoring::services::Options;
use monitoring::{MonitoringManager, MonitoringService};
use registry::{DataDir, FlockLocker, OsFs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const PROMETHEUS_CONFIG: &str = "monitoring/prometheus/prometheus.yml";

/// A data directory on disk with an installed monitoring stack whose
/// Prometheus reload endpoint is `server`
pub struct TestStack {
    pub temp: TempDir,
    pub manager: MonitoringManager,
}

impl TestStack {
    pub fn install(server: &MockPrometheusServer) -> Self {
        Self::install_with(server, Options::new(), None)
    }

    pub fn install_with(
        server: &MockPrometheusServer,
        mut overrides: Options,
        reload_timeout: Option<Duration>,
    ) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        overrides.insert("PROM_PORT".to_string(), server.port().to_string());
        let mut manager = MonitoringManager::new(
            datadir(&temp),
            MonitoringService::defaults(),
            overrides,
            reload_timeout,
        );
        manager.install().expect("Failed to install monitoring stack");
        Self { temp, manager }
    }

    /// Another manager on the same directory, as a concurrent process would
    /// open it
    pub fn second_manager(&self) -> MonitoringManager {
        let mut manager = MonitoringManager::new(
            datadir(&self.temp),
            MonitoringService::defaults(),
            Options::new(),
            None,
        );
        manager.install().expect("Failed to open monitoring stack");
        manager
    }

    pub fn config_path(&self) -> PathBuf {
        self.temp.path().join(PROMETHEUS_CONFIG)
    }

    pub fn config_bytes(&self) -> Vec<u8> {
        std::fs::read(self.config_path()).expect("Failed to read prometheus.yml")
    }

    pub fn config_yaml(&self) -> serde_yaml::Value {
        serde_yaml::from_slice(&self.config_bytes()).expect("prometheus.yml is not valid YAML")
    }

    /// `job_name`s in file order
    pub fn job_names(&self) -> Vec<String> {
        self.config_yaml()["scrape_configs"]
            .as_sequence()
            .map(|jobs| {
                jobs.iter()
                    .filter_map(|job| job["job_name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn datadir(temp: &TempDir) -> DataDir {
    DataDir::new(temp.path(), Arc::new(OsFs), Arc::new(FlockLocker)).expect("Failed to open data dir")
}
