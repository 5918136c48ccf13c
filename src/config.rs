//! Daemon configuration, loaded from `~/.config/kubeforge/config.toml`.
//!
//! Every section has working defaults so a missing file is not an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub engine: EngineConfig,
    pub registry: RegistryConfig,
    pub store: StoreConfig,
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kubeforge")
            .join("config.toml")
    }

    /// Load from an explicit path, or the default path if it exists,
    /// otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8844".into(),
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the automation shell scripts uploaded to nodes.
    pub scripts_dir: PathBuf,
    pub connect_timeout_secs: u64,
    /// Settle time between control plane readiness and addon installation.
    pub addon_settle_secs: u64,
    pub validation_delay_secs: u64,
    /// Pacing of synthetic phases when running in simulation mode.
    pub simulation_step_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("automation"),
            connect_timeout_secs: 30,
            addon_settle_secs: 60,
            validation_delay_secs: 15,
            simulation_step_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-installation log history cap; oldest entries are dropped first.
    pub max_log_entries: usize,
    /// Terminal installations older than this are swept from memory.
    pub retention_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_log_entries: 2000,
            retention_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Optional app secret; when set, the encryption key is derived from it
    /// instead of the generated key file.
    pub secret: Option<String>,
}

impl StoreConfig {
    pub fn clusters_file(&self) -> PathBuf {
        self.data_dir.join("clusters.json")
    }

    pub fn key_file(&self) -> PathBuf {
        self.data_dir.join("master.key")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("kubeforge"),
            secret: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.daemon.http_addr, "127.0.0.1:8844");
        assert_eq!(config.engine.connect_timeout_secs, 30);
        assert_eq!(config.registry.max_log_entries, 2000);
        assert!(config.store.clusters_file().ends_with("clusters.json"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            "[daemon]\nhttp_addr = \"0.0.0.0:9000\"\n\n[engine]\nconnect_timeout_secs = 5\n",
        )
        .unwrap();
        assert_eq!(config.daemon.http_addr, "0.0.0.0:9000");
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.engine.connect_timeout_secs, 5);
        assert_eq!(config.registry.retention_hours, 24);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.daemon.log_level, "info");
    }
}
