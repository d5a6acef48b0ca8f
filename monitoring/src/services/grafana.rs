// File: monitoring/src/services/grafana.rs
//! Grafana dashboards, provisioned with Prometheus as the default datasource

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

use super::{port_option, required_option, Options, ServiceApi, ServiceOptions};
use crate::constants::{containers, defaults, options as keys, paths};
use crate::errors::Result;

const DASHBOARDS_TEMPLATE: &str = include_str!("../../templates/grafana/dashboards.yml");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasourceFile {
    api_version: u32,
    datasources: Vec<Datasource>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Datasource {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    access: String,
    url: String,
    is_default: bool,
}

#[derive(Debug)]
pub struct GrafanaService {
    container_ip: IpAddr,
    port: u16,
}

impl Default for GrafanaService {
    fn default() -> Self {
        Self::new()
    }
}

impl GrafanaService {
    pub fn new() -> Self {
        Self {
            container_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl ServiceApi for GrafanaService {
    fn init(&mut self, options: ServiceOptions) -> Result<()> {
        self.port = port_option(&options.dotenv, keys::GRAFANA_PORT)?;
        Ok(())
    }

    fn setup(&self, options: &ServiceOptions) -> Result<()> {
        let prom_port = required_option(&options.dotenv, keys::PROM_PORT)?;

        let datasource = DatasourceFile {
            api_version: 1,
            datasources: vec![Datasource {
                name: "Prometheus".to_string(),
                kind: "prometheus".to_string(),
                access: "proxy".to_string(),
                url: format!("http://{}:{}", containers::PROMETHEUS, prom_port),
                is_default: true,
            }],
        };
        let stack = &options.stack;
        stack.create_dir(paths::GRAFANA_DATASOURCES_DIR)?;
        stack.write_file(
            paths::GRAFANA_DATASOURCE,
            serde_yaml::to_string(&datasource)?.as_bytes(),
        )?;

        stack.create_dir(paths::GRAFANA_DASHBOARDS_DIR)?;
        stack.write_file(paths::GRAFANA_DASHBOARDS, DASHBOARDS_TEMPLATE.as_bytes())?;
        debug!("Wrote Grafana provisioning files");
        Ok(())
    }

    fn dot_env(&self) -> Options {
        Options::from([(
            keys::GRAFANA_PORT.to_string(),
            defaults::GRAFANA_PORT.to_string(),
        )])
    }

    fn container_name(&self) -> &'static str {
        containers::GRAFANA
    }

    fn endpoint(&self) -> String {
        format!("http://{}:{}", self.container_ip, self.port)
    }

    fn set_container_ip(&mut self, ip: IpAddr) {
        self.container_ip = ip;
    }
}
