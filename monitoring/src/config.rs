// File: monitoring/src/config.rs
//! `main.toml` for the node monitor
//!
//! ```toml
//! data_dir = "/var/lib/node-registry"
//! reload_timeout_seconds = 10
//!
//! [env]
//! PROM_PORT = "9090"
//!
//! [[targets]]
//! endpoint = "http://10.0.0.5:9000"
//! instance_id = "geth-mainnet"
//! ```

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::services::{Options, Target};

pub const CONFIG_DIR_ENV: &str = "NODE_MONITOR_CONFIG_DIR";
pub const DEFAULT_CONFIG_DIR: &str = "config";
pub const MAIN_CONFIG_FILE: &str = "main.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Registry root; the user data directory location when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub reload_timeout_seconds: Option<u64>,
    /// Overrides of the services' default options
    #[serde(default)]
    pub env: Options,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl MonitorConfig {
    /// Load `main.toml` from `config_dir`. A missing file gives the defaults.
    pub async fn load(config_dir: impl AsRef<Path>) -> Result<Self> {
        let path = config_dir.as_ref().join(MAIN_CONFIG_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(anyhow!("Failed to read config {}: {}", path.display(), e)),
        };

        let config: MonitorConfig = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config {}: {}", path.display(), e))?;
        debug!(
            "Loaded config from {}: {} env overrides, {} targets",
            path.display(),
            config.env.len(),
            config.targets.len()
        );
        Ok(config)
    }

    pub fn reload_timeout(&self) -> Option<Duration> {
        self.reload_timeout_seconds.map(Duration::from_secs)
    }
}

/// Config directory from `NODE_MONITOR_CONFIG_DIR`, else `config`
pub fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}
