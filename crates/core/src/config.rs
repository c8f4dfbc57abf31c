//! Agent configuration, loaded once at startup and immutable thereafter.

use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{Error, Result};

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub gateway: GatewayConfig,
    pub message_bus: MessageBusConfig,
    pub backend: BackendConfig,
    pub capacity: CapacityConfig,
    /// Seconds between capacity advertisements.
    pub advertise_interval_secs: u64,
    /// Registry snapshot path; absent disables snapshotting entirely.
    pub state_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            message_bus: MessageBusConfig::default(),
            backend: BackendConfig::default(),
            capacity: CapacityConfig::default(),
            advertise_interval_secs: 10,
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    pub url: String,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit runtime socket; `None` uses the local daemon defaults.
    pub socket: Option<String>,
    pub image: String,
    pub workdir: String,
    pub shell: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            socket: None,
            image: "sandgate-task:latest".to_string(),
            workdir: "/workspace".to_string(),
            shell: "/bin/bash".to_string(),
        }
    }
}

/// Host capacity available for reservations, in whole megabytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            disk_mb: 1024,
        }
    }
}

impl CapacityConfig {
    // Saturating: an absurd configured capacity clamps rather than wraps.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(BYTES_PER_MEGABYTE)
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_mb.saturating_mul(BYTES_PER_MEGABYTE)
    }
}

impl AgentConfig {
    /// Layered load: an optional YAML file, then `SANDGATE__*` environment
    /// overrides (e.g. `SANDGATE__GATEWAY__PORT=9000`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder
            .add_source(Environment::with_prefix("SANDGATE").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }
}
