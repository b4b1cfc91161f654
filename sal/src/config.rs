use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";
pub const PID_FILE: &str = "consciousness.pid";
pub const LOG_FILE: &str = "consciousness.log";
pub const DEPLOYMENTS_FILE: &str = "vast_config.json";

/// Settings shared by every command, resolved from flags and environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub pool_dir: PathBuf,
    pub vastai_bin: String,
}

impl Settings {
    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.home.join(PID_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.home.join(LOG_FILE)
    }

    pub fn deployments_path(&self) -> PathBuf {
        self.home.join(DEPLOYMENTS_FILE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub consciousness: ConsciousnessConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsciousnessConfig {
    pub name: String,
    pub key_file: String,
    pub sid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks a free port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            bootstrap_nodes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Key file path, resolved against the directory holding the config.
    pub fn key_path(&self, home: &Path) -> PathBuf {
        home.join(&self.consciousness.key_file)
    }
}

/// Returns `None` when no config has been created yet.
pub fn load(path: &Path) -> Result<Option<NodeConfig>> {
    match std::fs::read_to_string(path) {
        Ok(data) => {
            let cfg = toml::from_str(&data)
                .with_context(|| format!("Invalid config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub fn save(path: &Path, cfg: &NodeConfig) -> Result<()> {
    let data = toml::to_string_pretty(cfg).context("Failed to encode config")?;
    std::fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
}
