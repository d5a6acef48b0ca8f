// File: monitoring/src/manager.rs
//! Installs the monitoring stack into a data directory and exposes the
//! scrape target operations of its Prometheus service

use registry::{DataDir, MonitoringStack};
use std::time::Duration;
use tracing::{info, instrument};

use crate::errors::{MonitoringError, Result};
use crate::services::{
    MonitoringService, Options, PrometheusService, ServiceApi, ServiceOptions, Target,
    TargetChanges,
};

pub struct MonitoringManager {
    datadir: DataDir,
    services: Vec<MonitoringService>,
    overrides: Options,
    stack: Option<MonitoringStack>,
}

impl MonitoringManager {
    /// `overrides` take precedence over the services' default options.
    /// `reload_timeout` bounds Prometheus reload requests.
    pub fn new(
        datadir: DataDir,
        mut services: Vec<MonitoringService>,
        overrides: Options,
        reload_timeout: Option<Duration>,
    ) -> Self {
        for service in &mut services {
            if let Some(prometheus) = service.as_prometheus_mut() {
                prometheus.set_reload_timeout(reload_timeout);
            }
        }
        Self {
            datadir,
            services,
            overrides,
            stack: None,
        }
    }

    /// Default options of every service with the overrides applied
    pub fn options(&self) -> Options {
        let mut options: Options = self.services.iter().flat_map(|s| s.dot_env()).collect();
        options.extend(self.overrides.clone());
        options
    }

    pub fn services(&self) -> &[MonitoringService] {
        &self.services
    }

    pub fn stack(&self) -> Option<&MonitoringStack> {
        self.stack.as_ref()
    }

    /// Create the stack on first use, writing every service's config files
    /// and `.env`, then initialize the services. Options persisted by an
    /// earlier install take precedence over the current ones.
    #[instrument(skip(self))]
    pub fn install(&mut self) -> Result<()> {
        let options = self.options();
        let services = &self.services;
        let stack = self.datadir.monitoring_stack_with(|stack| -> Result<()> {
            let service_options = ServiceOptions {
                stack: stack.clone(),
                dotenv: options.clone(),
            };
            for service in services {
                service.setup(&service_options)?;
            }
            stack.write_dotenv(&options)?;
            info!("Installed monitoring stack at {}", stack.path().display());
            Ok(())
        })?;

        let mut effective = options;
        if stack.installed()? {
            effective.extend(stack.read_dotenv()?);
        }
        for service in &mut self.services {
            service.init(ServiceOptions {
                stack: stack.clone(),
                dotenv: effective.clone(),
            })?;
        }
        self.stack = Some(stack);
        Ok(())
    }

    fn prometheus_mut(&mut self) -> Result<&mut PrometheusService> {
        self.services
            .iter_mut()
            .find_map(MonitoringService::as_prometheus_mut)
            .ok_or(MonitoringError::PrometheusNotConfigured)
    }

    pub async fn add_target(&mut self, endpoint: &str, instance_id: &str) -> Result<()> {
        self.prometheus_mut()?.add_target(endpoint, instance_id).await
    }

    pub async fn remove_target(&mut self, endpoint: &str) -> Result<()> {
        self.prometheus_mut()?.remove_target(endpoint).await
    }

    pub async fn sync_targets(&mut self, desired: &[Target]) -> Result<TargetChanges> {
        self.prometheus_mut()?.sync_targets(desired).await
    }

    /// Delete the stack directory with all service configuration
    #[instrument(skip(self))]
    pub fn uninstall(&mut self) -> Result<()> {
        self.datadir.remove_monitoring_stack()?;
        self.stack = None;
        info!("Uninstalled monitoring stack");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::{Fs, MemFs, MemLocker};
    use std::path::Path;
    use std::sync::Arc;

    fn manager(services: Vec<MonitoringService>, overrides: Options) -> (MemFs, MonitoringManager) {
        let fs = MemFs::new();
        let datadir = DataDir::new("/data", Arc::new(fs.clone()), Arc::new(MemLocker::new())).unwrap();
        (fs, MonitoringManager::new(datadir, services, overrides, None))
    }

    #[test]
    fn test_install_writes_service_files() {
        let (fs, mut manager) = manager(MonitoringService::defaults(), Options::new());
        manager.install().unwrap();

        for file in [
            "/data/monitoring/.env",
            "/data/monitoring/.lock",
            "/data/monitoring/prometheus/prometheus.yml",
            "/data/monitoring/grafana/provisioning/datasources/datasource.yml",
            "/data/monitoring/grafana/provisioning/dashboards/dashboards.yml",
        ] {
            assert!(fs.exists(Path::new(file)).unwrap(), "missing {}", file);
        }

        let datasource = fs
            .read(Path::new("/data/monitoring/grafana/provisioning/datasources/datasource.yml"))
            .unwrap();
        assert!(String::from_utf8(datasource).unwrap().contains("http://prometheus:9090"));
    }

    #[test]
    fn test_overrides_are_persisted_and_win_later() {
        let overrides = Options::from([("PROM_PORT".to_string(), "19090".to_string())]);
        let (fs, mut manager) = manager(MonitoringService::defaults(), overrides);
        manager.install().unwrap();

        let dotenv = String::from_utf8(fs.read(Path::new("/data/monitoring/.env")).unwrap()).unwrap();
        assert!(dotenv.contains("PROM_PORT=19090"));
        assert!(dotenv.contains("GRAFANA_PORT=3000"));

        let datadir = DataDir::new("/data", Arc::new(fs.clone()), Arc::new(MemLocker::new())).unwrap();
        let mut second = MonitoringManager::new(datadir, MonitoringService::defaults(), Options::new(), None);
        second.install().unwrap();
        let port = second
            .services
            .iter_mut()
            .find_map(MonitoringService::as_prometheus_mut)
            .map(|p| p.port());
        assert_eq!(port, Some(19090));
    }

    #[test]
    fn test_failed_setup_leaves_no_stack() {
        let overrides = Options::from([("NODE_EXPORTER_PORT".to_string(), String::new())]);
        let (fs, mut manager) = manager(MonitoringService::defaults(), overrides);

        let err = manager.install().unwrap_err();
        assert!(matches!(err, MonitoringError::InvalidOptions { ref key, .. } if key == "NODE_EXPORTER_PORT"));
        assert!(!fs.exists(Path::new("/data/monitoring")).unwrap());
        assert!(manager.stack().is_none());
    }

    #[tokio::test]
    async fn test_target_ops_without_prometheus() {
        let (_fs, mut manager) = manager(Vec::new(), Options::new());
        manager.install().unwrap();
        let err = manager.add_target("http://a:1", "x").await.unwrap_err();
        assert!(matches!(err, MonitoringError::PrometheusNotConfigured));
    }

    #[test]
    fn test_uninstall_removes_stack() {
        let (fs, mut manager) = manager(MonitoringService::defaults(), Options::new());
        manager.install().unwrap();
        manager.uninstall().unwrap();
        assert!(!fs.exists(Path::new("/data/monitoring")).unwrap());
        assert!(matches!(
            manager.uninstall(),
            Err(MonitoringError::Registry(registry::RegistryError::MonitoringStackNotFound { .. }))
        ));
    }
}
