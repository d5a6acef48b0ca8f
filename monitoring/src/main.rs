// File: monitoring/src/main.rs
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use monitoring::config::{self, MonitorConfig};
use monitoring::{MonitoringManager, MonitoringService, Target};
use registry::{DataDir, FlockLocker, Fs, Instance, Locker, OsFs};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("node_monitor=info".parse()?)
        .add_directive("registry=info".parse()?)
        .add_directive("monitoring=info".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting node monitor");

    let config_dir = config::config_dir();
    let config = MonitorConfig::load(&config_dir).await?;

    let fs: Arc<dyn Fs> = Arc::new(OsFs);
    let locker: Arc<dyn Locker> = Arc::new(FlockLocker);
    let datadir = match &config.data_dir {
        Some(path) => DataDir::new(path, fs, locker),
        None => DataDir::new_default(fs, locker),
    }
    .context("Failed to open data directory")?;
    info!("Using data directory {}", datadir.path().display());

    let mut manager = MonitoringManager::new(
        datadir.clone(),
        MonitoringService::defaults(),
        config.env.clone(),
        config.reload_timeout(),
    );
    manager
        .install()
        .context("Failed to install monitoring stack")?;

    let instances = datadir
        .list_instances()
        .context("Failed to list registered instances")?;
    info!("{} registered instances", instances.len());
    for instance in &instances {
        info!(
            "Instance {}: version {}, profile {}",
            instance.id(),
            instance.version,
            instance.profile
        );
    }

    if config.targets.is_empty() {
        return Ok(());
    }

    let known: HashSet<String> = instances.iter().map(Instance::id).collect();
    let desired: Vec<Target> = config
        .targets
        .iter()
        .filter(|target| {
            let registered = known.contains(&target.instance_id);
            if !registered {
                warn!(
                    "Skipping target {} for unknown instance {}",
                    target.endpoint, target.instance_id
                );
            }
            registered
        })
        .cloned()
        .collect();

    let changes = manager
        .sync_targets(&desired)
        .await
        .context("Failed to synchronize scrape targets")?;
    if changes.is_empty() {
        info!("Scrape targets already up to date");
    } else {
        info!(
            "Scrape targets updated: added {:?}, removed {:?}, relabeled {:?}",
            changes.added, changes.removed, changes.relabeled
        );
    }

    Ok(())
}
