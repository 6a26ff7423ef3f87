use crate::events::{Formatter, StreamOptions};
use crate::traffic::TrafficBackendConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub interfaces: InterfacesConfig,
    pub traffic: TrafficConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// `plain` or `json`, case-insensitive.
    pub format: String,
    pub runtime: String,
    /// Label key every lab container carries.
    pub lab_label: String,
    pub include_initial_state: bool,
    /// Capacity of the shared event channel between producers and the sink.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: "plain".into(),
            runtime: "docker".into(),
            lab_label: "containerlab".into(),
            include_initial_state: false,
            channel_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterfacesConfig {
    pub include_stats: bool,
    pub stats_interval_ms: u64,
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            include_stats: false,
            stats_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub enabled: bool,
    /// 0 means the 5s default; anything under 1s is raised to 1s.
    pub interval_ms: u64,
    pub bpffs_root: String,
    pub object_dir: String,
    pub services_file: String,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 5000,
            bpffs_root: "/sys/fs/bpf/lab_events_traffic".into(),
            object_dir: "/usr/local/lib/lab-events".into(),
            services_file: "/etc/services".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Empty means the Docker client's unix socket defaults.
    pub docker_socket: String,
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: String::new(),
            timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// Loads from `path`, else `CONFIG_FILE`, else `config.toml`. Only a missing
    /// `config.toml` at the default location falls back to defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_string(), true),
            None => match std::env::var("CONFIG_FILE") {
                Ok(p) => (p, true),
                Err(_) => (DEFAULT_CONFIG_FILE.to_string(), false),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(s) => Self::load_from_str(&s),
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(anyhow::anyhow!("config {path}: {e}")),
        }
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.stream.lab_label.trim().is_empty(),
            "stream.lab_label must be non-empty"
        );
        anyhow::ensure!(
            !self.stream.runtime.trim().is_empty(),
            "stream.runtime must be non-empty"
        );
        anyhow::ensure!(
            Formatter::from_name(&self.stream.format).is_ok(),
            "stream.format must be plain or json, got {:?}",
            self.stream.format
        );
        anyhow::ensure!(
            self.stream.channel_capacity > 0,
            "stream.channel_capacity must be > 0, got {}",
            self.stream.channel_capacity
        );
        anyhow::ensure!(
            self.interfaces.stats_interval_ms > 0,
            "interfaces.stats_interval_ms must be > 0, got {}",
            self.interfaces.stats_interval_ms
        );
        anyhow::ensure!(
            self.runtime.timeout_secs > 0,
            "runtime.timeout_secs must be > 0, got {}",
            self.runtime.timeout_secs
        );
        if self.traffic.enabled {
            anyhow::ensure!(
                !self.traffic.bpffs_root.is_empty(),
                "traffic.bpffs_root must be non-empty"
            );
            anyhow::ensure!(
                !self.traffic.object_dir.is_empty(),
                "traffic.object_dir must be non-empty"
            );
            anyhow::ensure!(
                !self.traffic.services_file.is_empty(),
                "traffic.services_file must be non-empty"
            );
        }
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            format: self.stream.format.clone(),
            runtime: self.stream.runtime.clone(),
            lab_label: self.stream.lab_label.clone(),
            include_initial_state: self.stream.include_initial_state,
            include_interface_stats: self.interfaces.include_stats,
            stats_interval: Duration::from_millis(self.interfaces.stats_interval_ms),
            include_traffic: self.traffic.enabled,
            traffic_interval: Duration::from_millis(self.traffic.interval_ms),
            services_file: PathBuf::from(&self.traffic.services_file),
            channel_capacity: self.stream.channel_capacity,
        }
    }

    pub fn traffic_backend(&self) -> TrafficBackendConfig {
        TrafficBackendConfig {
            bpffs_root: PathBuf::from(&self.traffic.bpffs_root),
            object_dir: PathBuf::from(&self.traffic.object_dir),
        }
    }
}
