// File: monitoring/src/services/node_exporter.rs
//! Host metrics exporter. Needs no config files of its own.

use std::net::{IpAddr, Ipv4Addr};

use super::{port_option, Options, ServiceApi, ServiceOptions};
use crate::constants::{containers, defaults, options as keys};
use crate::errors::Result;

#[derive(Debug)]
pub struct NodeExporterService {
    container_ip: IpAddr,
    port: u16,
}

impl Default for NodeExporterService {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeExporterService {
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

impl ServiceApi for NodeExporterService {
    fn init(&mut self, options: ServiceOptions) -> Result<()> {
        self.port = port_option(&options.dotenv, keys::NODE_EXPORTER_PORT)?;
        Ok(())
    }

    fn setup(&self, _options: &ServiceOptions) -> Result<()> {
        Ok(())
    }

    fn dot_env(&self) -> Options {
        Options::from([(
            keys::NODE_EXPORTER_PORT.to_string(),
            defaults::NODE_EXPORTER_PORT.to_string(),
        )])
    }

    fn container_name(&self) -> &'static str {
        containers::NODE_EXPORTER
    }

    fn endpoint(&self) -> String {
        format!("http://{}:{}", self.container_ip, self.port)
    }

    fn set_container_ip(&mut self, ip: IpAddr) {
        self.container_ip = ip;
    }
}
