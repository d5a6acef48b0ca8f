// File: monitoring/src/constants.rs
//! Names, option keys, default values and file locations shared by the
//! monitoring services

/// Container names of the stack services. Services reach each other by
/// these names on the stack network.
pub mod containers {
    pub const PROMETHEUS: &str = "prometheus";
    pub const NODE_EXPORTER: &str = "node-exporter";
    pub const GRAFANA: &str = "grafana";
}

/// Option keys as they appear in `.env`
pub mod options {
    pub const PROM_PORT: &str = "PROM_PORT";
    pub const NODE_EXPORTER_PORT: &str = "NODE_EXPORTER_PORT";
    pub const GRAFANA_PORT: &str = "GRAFANA_PORT";
}

/// Default option values. Each service exposes its own subset through
/// `dot_env()`; operator overrides are merged on top.
pub mod defaults {
    pub const PROM_PORT: &str = "9090";
    pub const NODE_EXPORTER_PORT: &str = "9100";
    pub const GRAFANA_PORT: &str = "3000";
}

/// Paths relative to the monitoring stack root
pub mod paths {
    pub const PROMETHEUS_DIR: &str = "prometheus";
    pub const PROMETHEUS_CONFIG: &str = "prometheus/prometheus.yml";

    pub const GRAFANA_DATASOURCES_DIR: &str = "grafana/provisioning/datasources";
    pub const GRAFANA_DATASOURCE: &str = "grafana/provisioning/datasources/datasource.yml";
    pub const GRAFANA_DASHBOARDS_DIR: &str = "grafana/provisioning/dashboards";
    pub const GRAFANA_DASHBOARDS: &str = "grafana/provisioning/dashboards/dashboards.yml";
}

pub mod prometheus {
    use std::time::Duration;

    /// Reload requests always go to the host-published port
    pub const RELOAD_HOST: &str = "127.0.0.1";
    pub const RELOAD_PATH: &str = "/-/reload";

    /// Stripped from endpoints to form job names
    pub const ENDPOINT_SCHEME: &str = "http://";

    /// Label marking jobs that belong to a registered instance
    pub const INSTANCE_ID_LABEL: &str = "instanceID";

    /// Pause between attempts to take a busy monitoring stack lock
    pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);
}
