use std::io::Write;

use clap::Parser;
use mesh_node::{cli::Cli, config::NodeConfig};

const CONFIG_YAML: &str = r#"
mesh:
  advertise_host: 10.1.0.7
  listen_port: 9400
  seed:
    host: 10.1.0.1
    port: 9000
  heartbeat_timeout_ms: 2500
  sync_interval_secs: 0
logging:
  level: debug
  json: true
fixtures: /var/lib/mesh/fixtures.json
"#;

#[tokio::test]
async fn test_config_file_loaded() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG_YAML.as_bytes()).unwrap();

    let config = NodeConfig::from_file(file.path()).await.unwrap();
    assert_eq!(config.mesh.advertise_host, "10.1.0.7");
    assert_eq!(config.mesh.listen_port, 9400);
    assert_eq!(config.mesh.seed.as_ref().unwrap().port, 9000);
    assert_eq!(config.mesh.heartbeat_timeout_ms, 2500);
    assert!(config.mesh.sync_interval().is_none());
    // untouched fields keep their defaults
    assert_eq!(config.mesh.reconnect_attempts, 3);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
    assert_eq!(
        config.fixtures.as_deref(),
        Some(std::path::Path::new("/var/lib/mesh/fixtures.json"))
    );
    config.validate().unwrap();
}

#[tokio::test]
async fn test_cli_overrides_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG_YAML.as_bytes()).unwrap();
    let path = file.path().to_string_lossy().into_owned();

    let cli = Cli::try_parse_from([
        "mesh-node",
        "--config",
        path.as_str(),
        "--port",
        "9500",
        "--max-connections",
        "4",
    ])
    .unwrap();
    let config = cli.load_config().await.unwrap();
    assert_eq!(config.mesh.listen_port, 9500);
    assert_eq!(config.mesh.max_connections, 4);
    assert_eq!(config.mesh.advertise_host, "10.1.0.7");
}

#[tokio::test]
async fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = NodeConfig::from_file(dir.path().join("absent.yaml")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_seed_pointing_at_self_rejected() {
    let cli = Cli::try_parse_from([
        "mesh-node",
        "--host",
        "127.0.0.1",
        "--port",
        "9000",
        "--seed",
        "127.0.0.1:9000",
    ])
    .unwrap();
    assert!(cli.load_config().await.is_err());
}
