// File: monitoring/src/services/mod.rs
//! Monitoring services and the capability interface they share
//!
//! The stack runs a fixed set of services. Each one declares its default
//! options, writes its config files into the stack on first install, and is
//! initialized from the merged options on every start.

pub mod grafana;
pub mod node_exporter;
pub mod prometheus;

pub use grafana::GrafanaService;
pub use node_exporter::NodeExporterService;
pub use prometheus::{PrometheusService, Target, TargetChanges};

use registry::MonitoringStack;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::errors::{MonitoringError, Result};

/// Service options keyed by `.env` variable name
pub type Options = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub stack: MonitoringStack,
    pub dotenv: Options,
}

pub trait ServiceApi {
    /// Validate options and bind the service to the stack
    fn init(&mut self, options: ServiceOptions) -> Result<()>;

    /// Write the service's config files. Runs once, when the stack is created.
    fn setup(&self, options: &ServiceOptions) -> Result<()>;

    /// Default options contributed by this service
    fn dot_env(&self) -> Options;

    fn container_name(&self) -> &'static str;

    fn endpoint(&self) -> String;

    fn set_container_ip(&mut self, ip: IpAddr);
}

/// The closed set of services a monitoring stack is made of
#[derive(Debug)]
pub enum MonitoringService {
    Prometheus(PrometheusService),
    NodeExporter(NodeExporterService),
    Grafana(GrafanaService),
}

impl MonitoringService {
    /// One of each service, in install order
    pub fn defaults() -> Vec<MonitoringService> {
        vec![
            MonitoringService::Prometheus(PrometheusService::new()),
            MonitoringService::NodeExporter(NodeExporterService::new()),
            MonitoringService::Grafana(GrafanaService::new()),
        ]
    }

    pub fn as_prometheus_mut(&mut self) -> Option<&mut PrometheusService> {
        match self {
            MonitoringService::Prometheus(service) => Some(service),
            _ => None,
        }
    }

    fn api(&self) -> &dyn ServiceApi {
        match self {
            MonitoringService::Prometheus(service) => service,
            MonitoringService::NodeExporter(service) => service,
            MonitoringService::Grafana(service) => service,
        }
    }

    fn api_mut(&mut self) -> &mut dyn ServiceApi {
        match self {
            MonitoringService::Prometheus(service) => service,
            MonitoringService::NodeExporter(service) => service,
            MonitoringService::Grafana(service) => service,
        }
    }
}

impl ServiceApi for MonitoringService {
    fn init(&mut self, options: ServiceOptions) -> Result<()> {
        self.api_mut().init(options)
    }

    fn setup(&self, options: &ServiceOptions) -> Result<()> {
        self.api().setup(options)
    }

    fn dot_env(&self) -> Options {
        self.api().dot_env()
    }

    fn container_name(&self) -> &'static str {
        self.api().container_name()
    }

    fn endpoint(&self) -> String {
        self.api().endpoint()
    }

    fn set_container_ip(&mut self, ip: IpAddr) {
        self.api_mut().set_container_ip(ip)
    }
}

/// Look up `key`, rejecting absent and empty values
pub(crate) fn required_option<'a>(options: &'a Options, key: &str) -> Result<&'a str> {
    match options.get(key) {
        None => Err(MonitoringError::missing_option(key)),
        Some(value) if value.is_empty() => Err(MonitoringError::invalid_option(key, "can't be empty")),
        Some(value) => Ok(value),
    }
}

/// Look up `key` as a TCP port in 1-65535
pub(crate) fn port_option(options: &Options, key: &str) -> Result<u16> {
    let value = required_option(options, key)?;
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(MonitoringError::invalid_option(key, "is not a valid port")),
    }
}
