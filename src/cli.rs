use std::path::PathBuf;

use anyhow::Context;
use chat_mesh::SeedConfig;
use clap::Parser;

use crate::config::NodeConfig;

/// Peer-mesh node for a federated chat backend
#[derive(Parser, Debug, Default)]
#[command(name = "mesh-node")]
#[command(about = "Runs one node of the chat peer mesh: membership, gossip and anti-entropy sync")]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "MESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on for peer connections
    #[arg(short, long, env = "MESH_PORT")]
    pub port: Option<u16>,

    /// Host other peers use to reach this node
    #[arg(long, env = "MESH_HOST")]
    pub host: Option<String>,

    /// Existing mesh member to join through, as host:port
    #[arg(long, env = "MESH_SEED")]
    pub seed: Option<String>,

    #[arg(long, env = "MESH_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// JSON file the peer directory is persisted to
    #[arg(long, env = "MESH_DIRECTORY")]
    pub directory: Option<PathBuf>,

    /// JSON file with rows to seed the local stores with
    #[arg(long, env = "MESH_FIXTURES")]
    pub fixtures: Option<PathBuf>,

    #[arg(long, env = "MESH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "MESH_LOG_JSON")]
    pub log_json: bool,

    /// Directory for daily-rolling log files
    #[arg(long, env = "MESH_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    /// Read the config file if one was given, apply flag overrides and
    /// validate the result.
    pub async fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path).await?,
            None => NodeConfig::default(),
        };
        self.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut NodeConfig) -> anyhow::Result<()> {
        if let Some(port) = self.port {
            config.mesh.listen_port = port;
        }
        if let Some(host) = &self.host {
            config.mesh.advertise_host = host.clone();
        }
        if let Some(seed) = &self.seed {
            config.mesh.seed = Some(SeedConfig::parse(seed).context("invalid --seed")?);
        }
        if let Some(max) = self.max_connections {
            config.mesh.max_connections = max;
        }
        if let Some(path) = &self.directory {
            config.mesh.directory_path = Some(path.clone());
        }
        if let Some(path) = &self.fixtures {
            config.fixtures = Some(path.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
        if let Some(dir) = &self.log_dir {
            config.logging.log_dir = Some(dir.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_values() {
        let mut config =
            NodeConfig::from_yaml("mesh:\n  listen_port: 9000\n  max_connections: 8\n").unwrap();
        let cli = Cli::try_parse_from([
            "mesh-node",
            "--port",
            "9200",
            "--seed",
            "10.0.0.5:9000",
            "--log-level",
            "debug",
        ])
        .unwrap();
        cli.apply(&mut config).unwrap();

        assert_eq!(config.mesh.listen_port, 9200);
        assert_eq!(config.mesh.max_connections, 8);
        assert_eq!(
            config.mesh.seed,
            Some(SeedConfig {
                host: "10.0.0.5".to_string(),
                port: 9000,
            })
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_bad_seed_rejected() {
        let cli = Cli {
            seed: Some("no-port".to_string()),
            ..Default::default()
        };
        assert!(cli.apply(&mut NodeConfig::default()).is_err());
    }
}
