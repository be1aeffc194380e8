//! Mesh configuration.
//!
//! Every field has a default so a config file only needs to name what it
//! changes. Durations are stored as integer seconds/milliseconds and exposed
//! through `Duration` accessors.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{MeshError, MeshResult},
    peer_directory::SocketKey,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeshConfig {
    /// Host other peers use to reach this node
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// Port the peer listener binds to (0 picks a free port)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Well-known peer contacted once at startup to join the mesh
    #[serde(default)]
    pub seed: Option<SeedConfig>,

    /// Upper bound on concurrently open peer connections (inbound + outbound)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Liveness verification period
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// How long a ping may go unanswered before the peer is presumed offline
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_gossip_interval_secs")]
    pub gossip_interval_secs: u64,

    #[serde(default = "default_gossip_initial_delay_secs")]
    pub gossip_initial_delay_secs: u64,

    /// Dial attempts per outbound slot before it is abandoned
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Seed-side delay before closing the one-shot sync connection
    #[serde(default = "default_bootstrap_grace_ms")]
    pub bootstrap_grace_ms: u64,

    /// Joiner-side delay between the splash disconnect and liveness verification
    #[serde(default = "default_splash_delay_ms")]
    pub splash_delay_ms: u64,

    /// Self-triggered anti-entropy period, 0 disables it
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Window in which sync triggers are coalesced into one round
    #[serde(default = "default_sync_min_interval_ms")]
    pub sync_min_interval_ms: u64,

    /// JSON file backing the peer directory; in-memory only when unset
    #[serde(default)]
    pub directory_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SeedConfig {
    pub host: String,
    pub port: u16,
}

impl SeedConfig {
    /// Parse `host:port`.
    pub fn parse(value: &str) -> MeshResult<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| MeshError::Config(format!("seed must be host:port, got '{}'", value)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| MeshError::Config(format!("invalid seed port '{}': {}", port, e)))?;
        if host.is_empty() {
            return Err(MeshError::Config("seed host is empty".to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn socket_key(&self) -> SocketKey {
        SocketKey::new(self.host.clone(), self.port)
    }
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    9000
}

fn default_max_connections() -> usize {
    64
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_gossip_interval_secs() -> u64 {
    30
}

fn default_gossip_initial_delay_secs() -> u64 {
    5
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_bootstrap_grace_ms() -> u64 {
    500
}

fn default_splash_delay_ms() -> u64 {
    1_000
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_sync_min_interval_ms() -> u64 {
    200
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            advertise_host: default_advertise_host(),
            listen_port: default_listen_port(),
            seed: None,
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            gossip_interval_secs: default_gossip_interval_secs(),
            gossip_initial_delay_secs: default_gossip_initial_delay_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            bootstrap_grace_ms: default_bootstrap_grace_ms(),
            splash_delay_ms: default_splash_delay_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            sync_min_interval_ms: default_sync_min_interval_ms(),
            directory_path: None,
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.advertise_host.trim().is_empty() {
            return Err(MeshError::Config("advertise_host must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(MeshError::Config("max_connections must be > 0".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(MeshError::Config("connect_timeout_ms must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_timeout_ms == 0 {
            return Err(MeshError::Config(
                "heartbeat interval and timeout must be > 0".into(),
            ));
        }
        if self.gossip_interval_secs == 0 {
            return Err(MeshError::Config("gossip_interval_secs must be > 0".into()));
        }
        if self.reconnect_attempts == 0 {
            return Err(MeshError::Config("reconnect_attempts must be > 0".into()));
        }
        if let Some(seed) = &self.seed {
            if seed.port == 0 {
                return Err(MeshError::Config("seed port must be > 0".into()));
            }
            if seed.host == self.advertise_host && seed.port == self.listen_port {
                return Err(MeshError::Config("seed points at this node".into()));
            }
        }
        Ok(())
    }

    pub fn local_key(&self) -> SocketKey {
        SocketKey::new(self.advertise_host.clone(), self.listen_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.gossip_interval_secs)
    }

    pub fn gossip_initial_delay(&self) -> Duration {
        Duration::from_secs(self.gossip_initial_delay_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn bootstrap_grace(&self) -> Duration {
        Duration::from_millis(self.bootstrap_grace_ms)
    }

    pub fn splash_delay(&self) -> Duration {
        Duration::from_millis(self.splash_delay_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    pub fn sync_min_interval(&self) -> Duration {
        Duration::from_millis(self.sync_min_interval_ms)
    }
}
