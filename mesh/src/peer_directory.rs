//! Durable directory of known peers
//!
//! Entries are keyed by the dialable `host:port` socket key and are never
//! removed, only marked OFFLINE. When a path is configured every mutation is
//! written through to a JSON file (temp file + rename) so a restarted node
//! keeps its own id and its view of the mesh.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{MeshError, MeshResult},
    metrics,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketKey {
    #[serde(rename = "ip")]
    pub host: String,
    pub port: u16,
}

impl SocketKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerState {
    Online,
    Offline,
    Connecting,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Online => "ONLINE",
            PeerState::Offline => "OFFLINE",
            PeerState::Connecting => "CONNECTING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: Uuid,
    #[serde(flatten)]
    pub address: SocketKey,
    pub state: PeerState,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
}

impl PeerIdentity {
    pub fn new(address: SocketKey, state: PeerState) -> Self {
        Self {
            id: Uuid::new_v4(),
            address,
            state,
            last_seen: Utc::now(),
        }
    }
}

/// How the local identity was obtained at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRole {
    /// Fresh identity, no seed configured: first node of a new mesh
    Genesis,
    /// Fresh identity, joining through a seed
    Joiner,
    /// Identity found in the directory
    Recovered,
}

/// Result of recording contact with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenOutcome {
    pub discovered: bool,
    pub came_online: bool,
}

#[derive(Debug)]
pub struct PeerDirectory {
    peers: DashMap<SocketKey, PeerIdentity>,
    path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl PeerDirectory {
    pub fn in_memory() -> Self {
        Self {
            peers: DashMap::new(),
            path: None,
            writer: Mutex::new(()),
        }
    }

    /// Open a file-backed directory. A missing file starts empty; an
    /// unreadable or corrupt one is an error.
    pub fn open(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref().to_path_buf();
        let peers = DashMap::new();

        if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                MeshError::Directory(format!("cannot read {}: {}", path.display(), e))
            })?;
            let entries: Vec<PeerIdentity> = serde_json::from_str(&raw).map_err(|e| {
                MeshError::Directory(format!("corrupt directory {}: {}", path.display(), e))
            })?;
            for entry in entries {
                peers.insert(entry.address.clone(), entry);
            }
            info!(path = %path.display(), peers = peers.len(), "Loaded peer directory");
        }

        Ok(Self {
            peers,
            path: Some(path),
            writer: Mutex::new(()),
        })
    }

    pub fn from_config_path(path: Option<&Path>) -> MeshResult<Self> {
        match path {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    /// Find or create the identity for this node.
    pub fn resolve_local(
        &self,
        key: &SocketKey,
        seed_configured: bool,
    ) -> MeshResult<(PeerIdentity, BootRole)> {
        let (identity, role) = match self.peers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let identity = entry.get_mut();
                identity.state = PeerState::Online;
                identity.last_seen = Utc::now();
                (identity.clone(), BootRole::Recovered)
            }
            Entry::Vacant(entry) => {
                let identity = PeerIdentity::new(key.clone(), PeerState::Online);
                entry.insert(identity.clone());
                let role = if seed_configured {
                    BootRole::Joiner
                } else {
                    BootRole::Genesis
                };
                (identity, role)
            }
        };
        self.persist()?;
        Ok((identity, role))
    }

    pub fn get(&self, key: &SocketKey) -> Option<PeerIdentity> {
        self.peers.get(key).map(|entry| entry.value().clone())
    }

    pub fn state_of(&self, key: &SocketKey) -> Option<PeerState> {
        self.peers.get(key).map(|entry| entry.state)
    }

    /// Record direct contact: ONLINE, fresh lastSeen, and the peer's own id
    /// when it told us one.
    pub fn upsert_seen(&self, key: &SocketKey, id: Option<Uuid>) -> MeshResult<SeenOutcome> {
        let outcome = match self.peers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let identity = entry.get_mut();
                let came_online = identity.state != PeerState::Online;
                identity.state = PeerState::Online;
                identity.last_seen = Utc::now();
                if let Some(id) = id {
                    identity.id = id;
                }
                SeenOutcome {
                    discovered: false,
                    came_online,
                }
            }
            Entry::Vacant(entry) => {
                let mut identity = PeerIdentity::new(key.clone(), PeerState::Online);
                if let Some(id) = id {
                    identity.id = id;
                }
                entry.insert(identity);
                SeenOutcome {
                    discovered: true,
                    came_online: true,
                }
            }
        };
        if outcome.came_online {
            metrics::record_peer_transition(PeerState::Online);
        }
        self.persist()?;
        Ok(outcome)
    }

    /// Insert a peer learned second-hand. Known peers keep their state.
    pub fn insert_if_absent(&self, identity: PeerIdentity) -> MeshResult<bool> {
        let inserted = match self.peers.entry(identity.address.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                debug!(peer = %identity.address, "Learned new peer");
                entry.insert(identity);
                true
            }
        };
        if inserted {
            self.persist()?;
        }
        Ok(inserted)
    }

    /// Returns true when the state actually changed. Unknown peers are left
    /// alone.
    pub fn set_state(&self, key: &SocketKey, state: PeerState) -> MeshResult<bool> {
        let changed = match self.peers.get_mut(key) {
            Some(mut entry) if entry.state != state => {
                entry.state = state;
                if state == PeerState::Online {
                    entry.last_seen = Utc::now();
                }
                true
            }
            _ => false,
        };
        if changed {
            metrics::record_peer_transition(state);
            self.persist()?;
        }
        Ok(changed)
    }

    /// All entries ordered by socket key
    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> =
            self.peers.iter().map(|entry| entry.value().clone()).collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    pub fn peers_except(&self, local: &SocketKey) -> Vec<PeerIdentity> {
        self.snapshot()
            .into_iter()
            .filter(|peer| &peer.address != local)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn persist(&self) -> MeshResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.writer.lock();
        let body = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| MeshError::Directory(format!("cannot write {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(port: u16) -> SocketKey {
        SocketKey::new("127.0.0.1", port)
    }

    #[test]
    fn test_resolve_local_roles() {
        let dir = PeerDirectory::in_memory();
        let (first, role) = dir.resolve_local(&key(7000), false).unwrap();
        assert_eq!(role, BootRole::Genesis);
        assert_eq!(first.state, PeerState::Online);

        let (again, role) = dir.resolve_local(&key(7000), false).unwrap();
        assert_eq!(role, BootRole::Recovered);
        assert_eq!(again.id, first.id);

        let (_, role) = dir.resolve_local(&key(7001), true).unwrap();
        assert_eq!(role, BootRole::Joiner);
    }

    #[test]
    fn test_state_transitions_reported_once() {
        let dir = PeerDirectory::in_memory();
        assert!(dir
            .insert_if_absent(PeerIdentity::new(key(7001), PeerState::Offline))
            .unwrap());

        assert!(dir.set_state(&key(7001), PeerState::Online).unwrap());
        assert!(!dir.set_state(&key(7001), PeerState::Online).unwrap());
        assert!(dir.set_state(&key(7001), PeerState::Offline).unwrap());
        assert!(!dir.set_state(&key(9999), PeerState::Offline).unwrap());
    }

    #[test]
    fn test_insert_if_absent_keeps_known_state() {
        let dir = PeerDirectory::in_memory();
        dir.upsert_seen(&key(7001), None).unwrap();
        assert!(!dir
            .insert_if_absent(PeerIdentity::new(key(7001), PeerState::Offline))
            .unwrap());
        assert_eq!(dir.state_of(&key(7001)), Some(PeerState::Online));
    }

    #[test]
    fn test_upsert_seen_refreshes_id() {
        let dir = PeerDirectory::in_memory();
        let outcome = dir.upsert_seen(&key(7001), None).unwrap();
        assert!(outcome.discovered && outcome.came_online);

        let id = Uuid::new_v4();
        let outcome = dir.upsert_seen(&key(7001), Some(id)).unwrap();
        assert!(!outcome.discovered && !outcome.came_online);
        assert_eq!(dir.get(&key(7001)).unwrap().id, id);
    }

    #[test]
    fn test_peers_except_self() {
        let dir = PeerDirectory::in_memory();
        dir.resolve_local(&key(7000), false).unwrap();
        dir.upsert_seen(&key(7002), None).unwrap();
        dir.upsert_seen(&key(7001), None).unwrap();

        let others: Vec<u16> = dir
            .peers_except(&key(7000))
            .iter()
            .map(|p| p.address.port)
            .collect();
        assert_eq!(others, vec![7001, 7002]);
    }

    #[test]
    fn test_wire_shape() {
        let mut peer = PeerIdentity::new(key(7001), PeerState::Connecting);
        peer.id = Uuid::nil();
        let value = serde_json::to_value(&peer).unwrap();
        assert_eq!(value["ip"], json!("127.0.0.1"));
        assert_eq!(value["port"], json!(7001));
        assert_eq!(value["state"], json!("CONNECTING"));
        assert_eq!(value["id"], json!("00000000-0000-0000-0000-000000000000"));
        assert!(value.get("lastSeen").is_some());

        let back: PeerIdentity = serde_json::from_value(value).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn test_persistence_recovers_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");

        let local_id = {
            let dir = PeerDirectory::open(&path).unwrap();
            let (me, role) = dir.resolve_local(&key(7000), true).unwrap();
            assert_eq!(role, BootRole::Joiner);
            dir.insert_if_absent(PeerIdentity::new(key(7001), PeerState::Offline))
                .unwrap();
            me.id
        };

        let dir = PeerDirectory::open(&path).unwrap();
        assert_eq!(dir.len(), 2);
        let (me, role) = dir.resolve_local(&key(7000), true).unwrap();
        assert_eq!(role, BootRole::Recovered);
        assert_eq!(me.id, local_id);
        assert_eq!(dir.state_of(&key(7001)), Some(PeerState::Offline));
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            PeerDirectory::open(&path),
            Err(MeshError::Directory(_))
        ));
    }
}
