//! Node configuration
//!
//! A YAML file supplies the base values; command-line flags and `MESH_*`
//! environment variables override them.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chat_mesh::MeshConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// JSON file with rows to seed the local stores with
    #[serde(default)]
    pub fixtures: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily-rolling log files are written here when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> anyhow::Result<LevelFilter> {
        self.level
            .parse::<LevelFilter>()
            .with_context(|| format!("invalid log level '{}'", self.level))
    }
}

impl NodeConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.mesh.validate().context("invalid mesh configuration")?;
        self.logging.level_filter()?;
        if self.mesh.listen_port == 0 && self.mesh.seed.is_some() {
            bail!("a joining node needs a fixed listen_port so peers can reach it");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_minimal_config() {
        let config = NodeConfig::from_yaml("mesh:\n  listen_port: 9100\n").unwrap();
        assert_eq!(config.mesh.listen_port, 9100);
        assert_eq!(config.mesh.advertise_host, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
        assert!(config.fixtures.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_empty_document_uses_defaults() {
        let config = NodeConfig::from_yaml("{}").unwrap();
        assert_eq!(config.mesh.listen_port, MeshConfig::default().listen_port);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = NodeConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_joiner_needs_fixed_port() {
        let config = NodeConfig::from_yaml(
            "mesh:\n  listen_port: 0\n  seed:\n    host: 10.0.0.1\n    port: 9000\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
