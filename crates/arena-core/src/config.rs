//! arena.toml: control-plane daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::quantity::{ResourceRequirement, parse_cpu_millis, parse_memory_bytes};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the game catalog TOML, relative to the config file.
    pub catalog: PathBuf,
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,
    #[serde(default = "default_detector_interval")]
    pub detector_interval: String,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: String,
    #[serde(default = "default_stop_escalation")]
    pub stop_escalation_after: String,
    #[serde(default = "default_crash_loop_threshold")]
    pub crash_loop_threshold: u32,
    /// Bearer token supervisors present on the internal API.
    #[serde(default)]
    pub internal_token: String,
    /// Base URL supervisors use to reach the internal API.
    #[serde(default = "default_internal_api_url")]
    pub internal_api_url: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            namespace: default_namespace(),
            reconcile_interval: default_reconcile_interval(),
            detector_interval: default_detector_interval(),
            startup_timeout: default_startup_timeout(),
            stop_escalation_after: default_stop_escalation(),
            crash_loop_threshold: default_crash_loop_threshold(),
            internal_token: String::new(),
            internal_api_url: default_internal_api_url(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}
fn default_namespace() -> String {
    "arena".to_string()
}
fn default_reconcile_interval() -> String {
    "15s".to_string()
}
fn default_detector_interval() -> String {
    "30s".to_string()
}
fn default_startup_timeout() -> String {
    "5m".to_string()
}
fn default_stop_escalation() -> String {
    "5m".to_string()
}
fn default_crash_loop_threshold() -> u32 {
    5
}
fn default_internal_api_url() -> String {
    "http://arenad:8080".to_string()
}

/// A node the allocator may place workloads on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub ip: String,
    pub cpu: String,
    pub memory: String,
    /// Inclusive host port range, e.g. `[7000, 7999]`.
    pub port_range: [u16; 2],
}

impl NodeSpec {
    pub fn capacity(&self) -> ConfigResult<ResourceRequirement> {
        let cpu_millis = parse_cpu_millis(&self.cpu).ok_or_else(|| ConfigError::InvalidQuantity {
            field: format!("nodes.{}.cpu", self.name),
            value: self.cpu.clone(),
        })?;
        let memory_bytes =
            parse_memory_bytes(&self.memory).ok_or_else(|| ConfigError::InvalidQuantity {
                field: format!("nodes.{}.memory", self.name),
                value: self.memory.clone(),
            })?;
        Ok(ResourceRequirement::new(cpu_millis, memory_bytes))
    }
}

/// Validated, typed view of the `[daemon]` section.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub api_port: u16,
    pub namespace: String,
    pub reconcile_interval: Duration,
    pub detector_interval: Duration,
    pub startup_timeout: Duration,
    pub stop_escalation_after: Duration,
    pub crash_loop_threshold: u32,
    pub internal_token: String,
    pub internal_api_url: String,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: DaemonConfig = toml::from_str(&content)?;
        if config.catalog.is_relative() {
            if let Some(dir) = path.parent() {
                config.catalog = dir.join(&config.catalog);
            }
        }
        Ok(config)
    }

    /// Validate every section. Any error here is fatal at startup.
    pub fn settings(&self) -> ConfigResult<DaemonSettings> {
        let d = &self.daemon;
        if d.internal_token.trim().is_empty() {
            return Err(ConfigError::Missing("daemon.internal_token".to_string()));
        }
        if d.crash_loop_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "daemon.crash_loop_threshold".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for node in &self.nodes {
            node.capacity()?;
            let [start, end] = node.port_range;
            if start == 0 || start > end {
                return Err(ConfigError::Invalid {
                    field: format!("nodes.{}.port_range", node.name),
                    reason: format!("{start}..={end} is not a valid range"),
                });
            }
        }

        Ok(DaemonSettings {
            api_port: d.api_port,
            namespace: d.namespace.clone(),
            reconcile_interval: duration_field("daemon.reconcile_interval", &d.reconcile_interval)?,
            detector_interval: duration_field("daemon.detector_interval", &d.detector_interval)?,
            startup_timeout: duration_field("daemon.startup_timeout", &d.startup_timeout)?,
            stop_escalation_after: duration_field(
                "daemon.stop_escalation_after",
                &d.stop_escalation_after,
            )?,
            crash_loop_threshold: d.crash_loop_threshold,
            internal_token: d.internal_token.clone(),
            internal_api_url: d.internal_api_url.clone(),
        })
    }
}

fn duration_field(field: &str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}
