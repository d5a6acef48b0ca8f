// File: monitoring/src/services/prometheus.rs
//! Prometheus service: owner of the scrape target list
//!
//! Every target edit follows the same sequence under the stack lock: read
//! `prometheus/prometheus.yml`, modify the job list, write the file back,
//! then ask the running Prometheus to reload. A failed reload leaves the new
//! file on disk; the next successful reload picks it up.

use registry::{MonitoringStack, StackGuard};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use super::{port_option, required_option, Options, ServiceApi, ServiceOptions};
use crate::constants::prometheus::{
    ENDPOINT_SCHEME, INSTANCE_ID_LABEL, LOCK_RETRY_INTERVAL, RELOAD_HOST, RELOAD_PATH,
};
use crate::constants::{containers, defaults, options as keys, paths};
use crate::errors::{MonitoringError, Result};

const CONFIG_TEMPLATE: &str = include_str!("../../templates/prometheus.yml");

/// `prometheus.yml`. Keys this crate does not model are carried through
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub scrape_interval: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default)]
    pub static_configs: Vec<StaticConfig>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ScrapeConfig {
    fn new(job_name: String, target: String, labels: BTreeMap<String, String>) -> Self {
        Self {
            job_name,
            static_configs: vec![StaticConfig {
                targets: vec![target],
                labels,
            }],
            extra: BTreeMap::new(),
        }
    }

    fn for_instance(job_name: &str, instance_id: &str) -> Self {
        let labels = BTreeMap::from([(INSTANCE_ID_LABEL.to_string(), instance_id.to_string())]);
        Self::new(job_name.to_string(), job_name.to_string(), labels)
    }

    /// The registered instance this job scrapes, if it belongs to one
    pub fn instance_id(&self) -> Option<&str> {
        self.static_configs
            .iter()
            .find_map(|sc| sc.labels.get(INSTANCE_ID_LABEL))
            .map(String::as_str)
    }

    fn set_instance_id(&mut self, instance_id: &str) {
        for static_config in &mut self.static_configs {
            if let Some(label) = static_config.labels.get_mut(INSTANCE_ID_LABEL) {
                *label = instance_id.to_string();
            }
        }
    }
}

/// A scrape target belonging to a registered instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub endpoint: String,
    pub instance_id: String,
}

impl Target {
    pub fn new(endpoint: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn job_name(&self) -> &str {
        job_name(&self.endpoint)
    }
}

/// Jobs touched by a target reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub relabeled: Vec<String>,
}

impl TargetChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.relabeled.is_empty()
    }
}

/// Job name of an endpoint: the endpoint without its `http://` scheme
fn job_name(endpoint: &str) -> &str {
    endpoint.strip_prefix(ENDPOINT_SCHEME).unwrap_or(endpoint)
}

/// Posts reload requests to the host-published Prometheus port
#[derive(Debug)]
struct Reloader {
    client: Client,
    port: u16,
    timeout: Option<Duration>,
}

impl Reloader {
    async fn reload(&self) -> Result<()> {
        let url = format!("http://{}:{}{}", RELOAD_HOST, self.port, RELOAD_PATH);
        let mut request = self.client.post(&url);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            let status = response.status().to_string();
            warn!("Prometheus rejected reload: {}", status);
            return Err(MonitoringError::ReloadFailed { status });
        }
        debug!("Prometheus configuration reloaded");
        Ok(())
    }
}

#[derive(Debug)]
pub struct PrometheusService {
    stack: Option<MonitoringStack>,
    container_ip: IpAddr,
    reloader: Reloader,
}

impl Default for PrometheusService {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusService {
    pub fn new() -> Self {
        Self {
            stack: None,
            container_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reloader: Reloader {
                client: Client::new(),
                port: 0,
                timeout: None,
            },
        }
    }

    /// Bound reload requests. Without a timeout a hanging Prometheus blocks
    /// the caller indefinitely.
    pub fn set_reload_timeout(&mut self, timeout: Option<Duration>) {
        self.reloader.timeout = timeout;
    }

    pub fn port(&self) -> u16 {
        self.reloader.port
    }

    fn stack(&self) -> Result<&MonitoringStack> {
        self.stack.as_ref().ok_or(MonitoringError::NotInitialized {
            service: containers::PROMETHEUS,
        })
    }

    /// Current on-disk configuration
    pub fn config(&self) -> Result<Config> {
        read_config(self.stack()?)
    }

    /// Register `endpoint` as a scrape job labelled with `instance_id`. A job
    /// with the same name is left as is, without a write or reload.
    #[instrument(skip(self))]
    pub async fn add_target(&mut self, endpoint: &str, instance_id: &str) -> Result<()> {
        let job = job_name(endpoint);
        let stack = lock_stack(&mut self.stack).await?;

        let mut config = read_config(&stack)?;
        if config.scrape_configs.iter().any(|sc| sc.job_name == job) {
            debug!("Scrape target {} already present", job);
            return Ok(());
        }
        config.scrape_configs.push(ScrapeConfig::for_instance(job, instance_id));
        write_config(&stack, &config)?;
        info!("Added scrape target {} for instance {}", job, instance_id);

        self.reloader.reload().await
    }

    /// Drop the scrape job for `endpoint`. Fails with `NonexistingEndpoint`
    /// and leaves the file untouched when there is no such job.
    #[instrument(skip(self))]
    pub async fn remove_target(&mut self, endpoint: &str) -> Result<()> {
        let job = job_name(endpoint);
        let stack = lock_stack(&mut self.stack).await?;

        let mut config = read_config(&stack)?;
        let position = config
            .scrape_configs
            .iter()
            .position(|sc| sc.job_name == job)
            .ok_or_else(|| MonitoringError::NonexistingEndpoint {
                endpoint: job.to_string(),
            })?;
        config.scrape_configs.remove(position);
        write_config(&stack, &config)?;
        info!("Removed scrape target {}", job);

        self.reloader.reload().await
    }

    /// Make the instance jobs match `desired` with a single write and reload.
    /// Jobs without an instance label are never touched.
    #[instrument(skip(self, desired), fields(desired = desired.len()))]
    pub async fn sync_targets(&mut self, desired: &[Target]) -> Result<TargetChanges> {
        let stack = lock_stack(&mut self.stack).await?;

        let mut config = read_config(&stack)?;
        let changes = reconcile(&mut config, desired);
        if changes.is_empty() {
            debug!("Scrape targets already in sync");
            return Ok(changes);
        }
        write_config(&stack, &config)?;
        info!(
            "Synchronized scrape targets: {} added, {} removed, {} relabeled",
            changes.added.len(),
            changes.removed.len(),
            changes.relabeled.len()
        );

        self.reloader.reload().await?;
        Ok(changes)
    }

    /// Ask the running Prometheus to re-read its configuration
    pub async fn reload_config(&self) -> Result<()> {
        self.stack()?;
        self.reloader.reload().await
    }
}

/// Wait for the stack lock without parking the runtime thread. The lock is
/// released when the guard drops, including when the calling future is
/// cancelled.
async fn lock_stack(stack: &mut Option<MonitoringStack>) -> Result<StackGuard<'_>> {
    let stack = stack.as_mut().ok_or(MonitoringError::NotInitialized {
        service: containers::PROMETHEUS,
    })?;
    while !stack.try_lock()? {
        trace!("Monitoring stack busy, retrying in {:?}", LOCK_RETRY_INTERVAL);
        tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
    }
    Ok(stack.lock_guard()?)
}

impl ServiceApi for PrometheusService {
    fn init(&mut self, options: ServiceOptions) -> Result<()> {
        self.reloader.port = port_option(&options.dotenv, keys::PROM_PORT)?;
        self.stack = Some(options.stack);
        Ok(())
    }

    /// Write a fresh config whose only job scrapes the node exporter.
    /// Existing jobs are discarded.
    fn setup(&self, options: &ServiceOptions) -> Result<()> {
        let node_exporter_port = required_option(&options.dotenv, keys::NODE_EXPORTER_PORT)?;

        let mut config: Config = serde_yaml::from_str(CONFIG_TEMPLATE)?;
        let endpoint = format!("{}:{}", containers::NODE_EXPORTER, node_exporter_port);
        config.scrape_configs = vec![ScrapeConfig::new(endpoint.clone(), endpoint, BTreeMap::new())];

        options.stack.create_dir(paths::PROMETHEUS_DIR)?;
        write_config(&options.stack, &config)?;
        debug!("Wrote {}", paths::PROMETHEUS_CONFIG);
        Ok(())
    }

    fn dot_env(&self) -> Options {
        Options::from([(keys::PROM_PORT.to_string(), defaults::PROM_PORT.to_string())])
    }

    fn container_name(&self) -> &'static str {
        containers::PROMETHEUS
    }

    fn endpoint(&self) -> String {
        format!("http://{}:{}", self.container_ip, self.reloader.port)
    }

    fn set_container_ip(&mut self, ip: IpAddr) {
        self.container_ip = ip;
    }
}

fn read_config(stack: &MonitoringStack) -> Result<Config> {
    let raw = stack.read_file(paths::PROMETHEUS_CONFIG)?;
    Ok(serde_yaml::from_slice(&raw)?)
}

fn write_config(stack: &MonitoringStack, config: &Config) -> Result<()> {
    let raw = serde_yaml::to_string(config)?;
    stack.write_file(paths::PROMETHEUS_CONFIG, raw.as_bytes())?;
    Ok(())
}

/// Rewrite the instance jobs of `config` to match `desired`. Returns what
/// changed; an empty result means `config` was not modified.
fn reconcile(config: &mut Config, desired: &[Target]) -> TargetChanges {
    let mut wanted: BTreeMap<&str, &str> = BTreeMap::new();
    let mut order = Vec::new();
    for target in desired {
        if !wanted.contains_key(target.job_name()) {
            wanted.insert(target.job_name(), &target.instance_id);
            order.push(target.job_name());
        }
    }

    let mut changes = TargetChanges::default();
    let mut present = BTreeSet::new();
    config.scrape_configs.retain_mut(|job| {
        let Some(current) = job.instance_id().map(str::to_string) else {
            present.insert(job.job_name.clone());
            return true;
        };
        match wanted.get(job.job_name.as_str()) {
            Some(&instance_id) => {
                present.insert(job.job_name.clone());
                if current != instance_id {
                    job.set_instance_id(instance_id);
                    changes.relabeled.push(job.job_name.clone());
                }
                true
            }
            None => {
                changes.removed.push(job.job_name.clone());
                false
            }
        }
    });

    for job in order {
        if present.contains(job) {
            continue;
        }
        if let Some(&instance_id) = wanted.get(job) {
            config.scrape_configs.push(ScrapeConfig::for_instance(job, instance_id));
            changes.added.push(job.to_string());
        }
    }
    changes
}
