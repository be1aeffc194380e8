//! Membership: local identity, bootstrap through a seed, liveness and gossip
//!
//! Startup runs identity resolution, then listen, then (with a seed) the
//! bootstrap hand-off:
//!
//! 1. dial the seed and send `add-peer`
//! 2. on success send `sync-request` on the same connection
//! 3. the seed replies with its peer list and closes the connection after a
//!    grace delay
//! 4. the joiner records unknown peers as OFFLINE, closes every connection
//!    (splash) and after a short delay runs a liveness round
//!
//! Liveness rounds ping every known peer (dialing those not connected) and
//! mark peers OFFLINE when a ping goes unanswered. Gossip only broadcasts
//! `list-peers-request`; replies are logged, not merged.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing as log;

use crate::{
    config::MeshConfig,
    error::{MeshError, MeshResult},
    metrics,
    notifier::{ChangeKind, ChangeNotifier},
    peer_directory::{BootRole, PeerDirectory, PeerIdentity, PeerState, SeenOutcome, SocketKey},
    protocol::{
        decode_payload, Action, AddPeerPayload, PingPayload, RequestEnvelope, ResponseEnvelope,
    },
    router::{MessageRouter, RequestHandler, ResponseHandler},
    scheduler::PeriodicTask,
    transport::{Broadcaster, Connection, ConnectionEvent, Transport},
};

pub struct MembershipManager {
    config: Arc<MeshConfig>,
    directory: Arc<PeerDirectory>,
    transport: Arc<Transport>,
    notifier: Arc<ChangeNotifier>,
    local: RwLock<Option<PeerIdentity>>,
    /// Peer -> sequence number of the ping awaiting a pong
    pending_pings: DashMap<SocketKey, u64>,
    ping_seq: AtomicU64,
    cancel: CancellationToken,
    weak_self: Weak<MembershipManager>,
}

impl std::fmt::Debug for MembershipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipManager")
            .field("local", &*self.local.read())
            .field("pending_pings", &self.pending_pings.len())
            .finish()
    }
}

impl MembershipManager {
    pub fn new(
        config: Arc<MeshConfig>,
        directory: Arc<PeerDirectory>,
        transport: Arc<Transport>,
        notifier: Arc<ChangeNotifier>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            directory,
            transport,
            notifier,
            local: RwLock::new(None),
            pending_pings: DashMap::new(),
            ping_seq: AtomicU64::new(1),
            cancel,
            weak_self: weak_self.clone(),
        })
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn resolve_identity(&self, local_key: &SocketKey) -> MeshResult<BootRole> {
        let (identity, role) = self
            .directory
            .resolve_local(local_key, self.config.seed.is_some())?;
        log::info!(
            id = %identity.id,
            addr = %identity.address,
            role = ?role,
            "Resolved local identity"
        );
        *self.local.write() = Some(identity);
        Ok(role)
    }

    pub fn local_identity(&self) -> MeshResult<PeerIdentity> {
        self.local
            .read()
            .clone()
            .ok_or_else(|| MeshError::Config("local identity not resolved yet".into()))
    }

    pub fn local_key(&self) -> Option<SocketKey> {
        self.local.read().as_ref().map(|id| id.address.clone())
    }

    fn is_local(&self, key: &SocketKey) -> bool {
        self.local_key().as_ref() == Some(key)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    pub fn register_handlers(&self, router: &MessageRouter) {
        let weak = self.weak_self.clone();
        router.register_action(
            Action::AddPeer,
            request_handler(weak.clone(), |m, conn, payload| m.handle_add_peer(conn, payload)),
        );
        router.register_action(
            Action::SyncRequest,
            request_handler(weak.clone(), |m, conn, _| m.handle_sync_request(conn)),
        );
        router.register_action(
            Action::Ping,
            request_handler(weak.clone(), |m, conn, payload| m.handle_ping(conn, payload)),
        );
        router.register_action(
            Action::ListPeersRequest,
            request_handler(weak.clone(), |m, _, _| m.handle_list_peers()),
        );

        router.register_response_handler(
            Action::AddPeer,
            response_handler(weak.clone(), |m, conn, resp| m.on_add_peer_reply(conn, resp)),
        );
        router.register_response_handler(
            Action::SyncRequest,
            response_handler(weak.clone(), |m, conn, resp| m.on_peer_list(conn, resp)),
        );
        router.register_response_handler(
            Action::Pong,
            response_handler(weak.clone(), |m, conn, resp| m.on_pong(conn, resp)),
        );
        router.register_response_handler(
            Action::ListPeersRequest,
            response_handler(weak, |_, conn, resp| log_gossip_reply(conn, resp)),
        );
    }

    /// Seed side of the bootstrap handshake
    fn handle_add_peer(
        &self,
        conn: &Arc<Connection>,
        payload: Option<Value>,
    ) -> MeshResult<Option<ResponseEnvelope>> {
        let AddPeerPayload { ip, port } = decode_payload(Action::AddPeer, payload)?;
        if port == 0 {
            return Err(MeshError::invalid_payload("add-peer", "port must be > 0"));
        }
        let key = SocketKey::new(ip, port);
        log::info!(peer = %key, conn = conn.id(), "Peer joining through this node");

        let outcome = self.directory.upsert_seen(&key, None)?;
        self.emit_seen(&key, outcome);
        conn.mark_authenticated();
        Ok(Some(ResponseEnvelope::success(Action::AddPeer, None)))
    }

    /// Seed side: hand over the peer list, then drop the one-shot connection.
    fn handle_sync_request(&self, conn: &Arc<Connection>) -> MeshResult<Option<ResponseEnvelope>> {
        let peers = serde_json::to_value(self.directory.snapshot())?;

        let transport = self.transport.clone();
        let conn = conn.clone();
        let grace = self.config.bootstrap_grace();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = cancel.cancelled() => {}
            }
            log::debug!(conn = conn.id(), "Closing bootstrap connection");
            transport.close(&conn);
        });

        Ok(Some(ResponseEnvelope::success(Action::SyncRequest, Some(peers))))
    }

    fn handle_ping(
        &self,
        conn: &Arc<Connection>,
        payload: Option<Value>,
    ) -> MeshResult<Option<ResponseEnvelope>> {
        let ping: PingPayload = decode_payload(Action::Ping, payload)?;
        let local = self.local_identity()?;
        let key = SocketKey::new(conn.remote_addr().ip().to_string(), ping.listen_port);

        if key != local.address {
            let outcome = self.directory.upsert_seen(&key, Some(ping.uuid))?;
            self.emit_seen(&key, outcome);
            conn.bind_peer(key);
            conn.mark_authenticated();
        }

        let pong = PingPayload {
            uuid: local.id,
            listen_port: local.address.port,
        };
        Ok(Some(ResponseEnvelope::success(
            Action::Pong,
            Some(serde_json::to_value(pong)?),
        )))
    }

    fn handle_list_peers(&self) -> MeshResult<Option<ResponseEnvelope>> {
        let peers = serde_json::to_value(self.directory.snapshot())?;
        Ok(Some(ResponseEnvelope::success(
            Action::ListPeersRequest,
            Some(peers),
        )))
    }

    fn on_add_peer_reply(&self, conn: &Arc<Connection>, resp: ResponseEnvelope) {
        if !resp.is_success() {
            log::warn!(
                conn = conn.id(),
                "Seed rejected add-peer: {}",
                resp.message.unwrap_or_default()
            );
            return;
        }
        log::debug!(conn = conn.id(), "Seed accepted add-peer, requesting peer list");
        self.transport
            .send_request_on(conn, RequestEnvelope::new(Action::SyncRequest, Some(json!({}))));
    }

    /// Joiner side: persist the seed's list, splash, then verify liveness.
    fn on_peer_list(&self, conn: &Arc<Connection>, resp: ResponseEnvelope) {
        if !resp.is_success() {
            log::warn!(conn = conn.id(), "Peer list request failed: {:?}", resp.message);
            return;
        }
        let peers: Vec<PeerIdentity> = match decode_payload(Action::SyncRequest, resp.data) {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!(conn = conn.id(), "Ignoring peer list: {}", e);
                return;
            }
        };

        let mut learned = 0;
        for peer in peers {
            if self.is_local(&peer.address) {
                continue;
            }
            let key = peer.address.clone();
            let candidate = PeerIdentity {
                state: PeerState::Offline,
                ..peer
            };
            match self.directory.insert_if_absent(candidate) {
                Ok(true) => {
                    learned += 1;
                    self.notifier.emit(
                        ChangeKind::PeerDiscovered,
                        json!({ "peer": key.to_string() }),
                    );
                }
                Ok(false) => {}
                Err(e) => log::warn!(peer = %key, "Failed to record peer: {}", e),
            }
        }

        let closed = self.transport.disconnect_all();
        log::info!(
            learned,
            closed,
            known = self.directory.len(),
            "Bootstrap complete, verifying liveness after {:?}",
            self.config.splash_delay()
        );

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let delay = self.config.splash_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => this.run_liveness_round().await,
                _ = this.cancel.cancelled() => {}
            }
        });
    }

    fn on_pong(&self, conn: &Arc<Connection>, resp: ResponseEnvelope) {
        if !resp.is_success() {
            log::debug!(conn = conn.id(), "Error pong: {:?}", resp.message);
            return;
        }
        let pong: PingPayload = match decode_payload(Action::Pong, resp.data) {
            Ok(pong) => pong,
            Err(e) => {
                log::debug!(conn = conn.id(), "Ignoring pong: {}", e);
                return;
            }
        };

        let key = conn
            .peer()
            .unwrap_or_else(|| SocketKey::new(conn.remote_addr().ip().to_string(), pong.listen_port));
        self.pending_pings.remove(&key);
        conn.mark_authenticated();
        log::trace!(peer = %key, "Pong");

        // A late pong after a timeout lands here too and re-marks the peer.
        match self.directory.upsert_seen(&key, Some(pong.uuid)) {
            Ok(outcome) => self.emit_seen(&key, outcome),
            Err(e) => log::warn!(peer = %key, "Failed to record pong: {}", e),
        }
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Dial the seed and start the add-peer / sync-request hand-off. The rest
    /// of the exchange is driven by the reply handlers.
    pub async fn bootstrap(&self, seed: &SocketKey) -> MeshResult<()> {
        let local = self.local_identity()?;
        log::info!(seed = %seed, "Joining mesh through seed");

        let conn = self.transport.connect_once(seed).await?;
        let payload = AddPeerPayload {
            ip: local.address.host.clone(),
            port: local.address.port,
        };
        let request = RequestEnvelope::with_payload(Action::AddPeer, &payload)?;
        if !self.transport.send_request_on(&conn, request) {
            return Err(MeshError::NotConnected(seed.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Liveness and gossip
    // ========================================================================

    /// Check every known peer other than this node, in random order.
    pub async fn run_liveness_round(&self) {
        let Some(local) = self.local_key() else {
            return;
        };
        let mut peers = self.directory.peers_except(&local);
        if peers.is_empty() {
            log::trace!("Liveness round: no peers");
            return;
        }
        peers.shuffle(&mut rand::rng());

        log::debug!(peers = peers.len(), "Liveness round");
        join_all(peers.iter().map(|peer| self.check_peer(&peer.address))).await;
    }

    async fn check_peer(&self, key: &SocketKey) {
        if let Some(conn) = self.transport.connection_for(key) {
            log::trace!(peer = %key, idle = ?conn.idle_for(), "Pinging connected peer");
            self.send_ping(&conn, key);
            return;
        }

        // CONNECTING is transient; only the settled state is compared
        let before = self.directory.state_of(key);
        if let Err(e) = self.directory.set_state(key, PeerState::Connecting) {
            log::warn!(peer = %key, "Failed to update peer state: {}", e);
        }
        match self.transport.connect_to_peer(key).await {
            Ok(conn) => {
                self.send_ping(&conn, key);
                self.settle(key, before, PeerState::Online);
            }
            Err(e) => {
                log::debug!(peer = %key, "Peer unreachable: {}", e);
                self.settle(key, before, PeerState::Offline);
            }
        }
    }

    /// Leave CONNECTING for `after`. Emits only when `after` differs from
    /// the state the peer had before the dial.
    fn settle(&self, key: &SocketKey, before: Option<PeerState>, after: PeerState) {
        if before == Some(after) {
            if let Err(e) = self.directory.set_state(key, after) {
                log::warn!(peer = %key, "Failed to restore peer state: {}", e);
            }
            return;
        }
        match after {
            PeerState::Online => self.mark_online(key),
            _ => self.mark_offline(key),
        }
    }

    /// Send a ping and arm its timeout. Only the latest ping per peer counts.
    fn send_ping(&self, conn: &Arc<Connection>, key: &SocketKey) {
        let Ok(local) = self.local_identity() else {
            return;
        };
        let ping = PingPayload {
            uuid: local.id,
            listen_port: local.address.port,
        };
        let request = match RequestEnvelope::with_payload(Action::Ping, &ping) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Failed to build ping: {}", e);
                return;
            }
        };

        let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
        self.pending_pings.insert(key.clone(), seq);
        self.transport.send_request_on(conn, request);

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let key = key.clone();
        let timeout = self.config.heartbeat_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = this.cancel.cancelled() => return,
            }
            if this
                .pending_pings
                .remove_if(&key, |_, pending| *pending == seq)
                .is_some()
            {
                log::info!(peer = %key, "No pong within {:?}, marking offline", timeout);
                metrics::record_liveness_timeout();
                this.mark_offline(&key);
            }
        });
    }

    /// Ask every connected peer for its peer list.
    pub fn run_gossip(&self) -> usize {
        let sent = self
            .transport
            .broadcast(&RequestEnvelope::new(Action::ListPeersRequest, Some(json!({}))));
        log::trace!(sent, "Gossip broadcast");
        sent
    }

    pub fn has_pending_ping(&self, key: &SocketKey) -> bool {
        self.pending_pings.contains_key(key)
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn mark_online(&self, key: &SocketKey) {
        match self.directory.set_state(key, PeerState::Online) {
            Ok(true) => self.emit_peer(ChangeKind::PeerOnline, key),
            Ok(false) => {}
            Err(e) => log::warn!(peer = %key, "Failed to mark peer online: {}", e),
        }
    }

    fn mark_offline(&self, key: &SocketKey) {
        match self.directory.set_state(key, PeerState::Offline) {
            Ok(true) => self.emit_peer(ChangeKind::PeerOffline, key),
            Ok(false) => {}
            Err(e) => log::warn!(peer = %key, "Failed to mark peer offline: {}", e),
        }
    }

    fn emit_seen(&self, key: &SocketKey, outcome: SeenOutcome) {
        if outcome.discovered {
            self.emit_peer(ChangeKind::PeerDiscovered, key);
        }
        if outcome.came_online {
            self.emit_peer(ChangeKind::PeerOnline, key);
        }
    }

    fn emit_peer(&self, kind: ChangeKind, key: &SocketKey) {
        let id = self.directory.get(key).map(|peer| peer.id.to_string());
        log::info!(peer = %key, "{}", kind);
        self.notifier
            .emit(kind, json!({ "peer": key.to_string(), "id": id }));
    }

    /// React to connection teardown. A peer goes OFFLINE only once its last
    /// live connection is gone.
    pub fn handle_connection_event(&self, event: &ConnectionEvent) {
        if let ConnectionEvent::Closed {
            peer: Some(key), ..
        } = event
        {
            if !self.transport.is_connected(key) {
                self.mark_offline(key);
            }
        }
    }

    pub fn spawn_disconnect_listener(&self) -> Option<tokio::task::JoinHandle<()>> {
        let this = self.weak_self.upgrade()?;
        let mut events = self.transport.subscribe();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => this.handle_connection_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!(skipped, "Connection event listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = this.cancel.cancelled() => break,
                }
            }
        }))
    }

    /// Liveness and gossip timers
    pub fn start_timers(&self) -> Vec<PeriodicTask> {
        let Some(this) = self.weak_self.upgrade() else {
            return Vec::new();
        };

        let liveness = {
            let this = this.clone();
            PeriodicTask::spawn(
                "liveness",
                self.config.heartbeat_interval(),
                self.config.heartbeat_interval(),
                self.cancel.child_token(),
                move || {
                    let this = this.clone();
                    async move { this.run_liveness_round().await }
                },
            )
        };
        let gossip = PeriodicTask::spawn(
            "gossip",
            self.config.gossip_initial_delay(),
            self.config.gossip_interval(),
            self.cancel.child_token(),
            move || {
                let this = this.clone();
                async move {
                    this.run_gossip();
                }
            },
        );
        vec![liveness, gossip]
    }
}

fn log_gossip_reply(conn: &Arc<Connection>, resp: ResponseEnvelope) {
    let count = resp
        .data
        .as_ref()
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    log::debug!(conn = conn.id(), peers = count, "Gossip reply");
}

/// Wrap a membership method as a request handler holding only a weak
/// reference, so the router does not keep the manager alive.
fn request_handler<F>(weak: Weak<MembershipManager>, f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(&MembershipManager, &Arc<Connection>, Option<Value>) -> MeshResult<Option<ResponseEnvelope>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(
        move |conn: &Arc<Connection>, payload: Option<Value>| -> MeshResult<Option<ResponseEnvelope>> {
            let manager = weak
                .upgrade()
                .ok_or_else(|| MeshError::Config("membership manager dropped".into()))?;
            f(&manager, conn, payload)
        },
    )
}

fn response_handler<F>(weak: Weak<MembershipManager>, f: F) -> Arc<dyn ResponseHandler>
where
    F: Fn(&MembershipManager, &Arc<Connection>, ResponseEnvelope) + Send + Sync + 'static,
{
    Arc::new(move |conn: &Arc<Connection>, resp: ResponseEnvelope| {
        if let Some(manager) = weak.upgrade() {
            f(&manager, conn, resp);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;

    fn manager(config: MeshConfig) -> (Arc<MembershipManager>, Arc<MessageRouter>) {
        let config = Arc::new(config);
        let router = Arc::new(MessageRouter::new());
        let cancel = CancellationToken::new();
        let transport = Transport::new(config.clone(), router.clone(), cancel.clone());
        let manager = MembershipManager::new(
            config,
            Arc::new(PeerDirectory::in_memory()),
            transport,
            Arc::new(ChangeNotifier::new()),
            cancel,
        );
        manager.register_handlers(&router);
        (manager, router)
    }

    #[tokio::test]
    async fn test_ping_upserts_sender_and_replies_pong() {
        let (manager, router) = manager(MeshConfig::default());
        let role = manager
            .resolve_identity(&SocketKey::new("127.0.0.1", 7000))
            .unwrap();
        assert_eq!(role, BootRole::Genesis);

        let sender = uuid::Uuid::new_v4();
        let (conn, _rx) = Connection::detached();
        let request = RequestEnvelope::with_payload(
            Action::Ping,
            &PingPayload {
                uuid: sender,
                listen_port: 7001,
            },
        )
        .unwrap();

        let reply = router.dispatch(&conn, Envelope::Request(request)).unwrap();
        assert_eq!(reply.action, "pong");
        let pong: PingPayload = serde_json::from_value(reply.data.unwrap()).unwrap();
        assert_eq!(pong.listen_port, 7000);
        assert_eq!(pong.uuid, manager.local_identity().unwrap().id);

        let key = SocketKey::new("127.0.0.1", 7001);
        let peer = manager.directory.get(&key).unwrap();
        assert_eq!(peer.id, sender);
        assert_eq!(peer.state, PeerState::Online);
        assert_eq!(conn.peer(), Some(key));
    }

    #[tokio::test]
    async fn test_malformed_ping_is_dropped() {
        let (manager, router) = manager(MeshConfig::default());
        manager
            .resolve_identity(&SocketKey::new("127.0.0.1", 7000))
            .unwrap();
        let (conn, _rx) = Connection::detached();

        let reply = router.dispatch(
            &conn,
            RequestEnvelope::new(Action::Ping, Some(json!({"listenPort": "x"}))).into(),
        );
        assert!(reply.is_none());
        assert_eq!(manager.directory.len(), 1);
    }

    #[tokio::test]
    async fn test_add_peer_requires_port() {
        let (manager, router) = manager(MeshConfig::default());
        manager
            .resolve_identity(&SocketKey::new("127.0.0.1", 7000))
            .unwrap();
        let (conn, _rx) = Connection::detached();

        let reply = router
            .dispatch(
                &conn,
                RequestEnvelope::new(Action::AddPeer, Some(json!({"ip": "10.0.0.9", "port": 0})))
                    .into(),
            )
            .unwrap();
        assert!(!reply.is_success());

        let reply = router
            .dispatch(
                &conn,
                RequestEnvelope::new(Action::AddPeer, Some(json!({"ip": "10.0.0.9", "port": 7009})))
                    .into(),
            )
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(
            manager
                .directory
                .state_of(&SocketKey::new("10.0.0.9", 7009)),
            Some(PeerState::Online)
        );
    }

    #[tokio::test]
    async fn test_list_peers_reply_is_not_merged() {
        let (manager, router) = manager(MeshConfig::default());
        manager
            .resolve_identity(&SocketKey::new("127.0.0.1", 7000))
            .unwrap();
        let (conn, _rx) = Connection::detached();

        let stranger = PeerIdentity::new(SocketKey::new("10.9.9.9", 7100), PeerState::Online);
        router.dispatch(
            &conn,
            ResponseEnvelope::success(
                Action::ListPeersRequest,
                Some(serde_json::to_value(vec![stranger]).unwrap()),
            )
            .into(),
        );
        assert_eq!(manager.directory.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failed_dials_emit_one_offline() {
        let (manager, _router) = manager(MeshConfig {
            reconnect_attempts: 1,
            reconnect_delay_ms: 10,
            ..MeshConfig::default()
        });
        manager
            .resolve_identity(&SocketKey::new("127.0.0.1", 7000))
            .unwrap();
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            SocketKey::new("127.0.0.1", listener.local_addr().unwrap().port())
        };
        manager
            .directory
            .insert_if_absent(PeerIdentity::new(dead.clone(), PeerState::Online))
            .unwrap();

        let mut changes = manager.notifier.subscribe();
        for _ in 0..3 {
            manager.run_liveness_round().await;
            assert_eq!(manager.directory.state_of(&dead), Some(PeerState::Offline));
        }

        let mut offline = 0;
        while let Ok(event) = changes.try_recv() {
            assert_eq!(event.kind, ChangeKind::PeerOffline);
            offline += 1;
        }
        assert_eq!(offline, 1);
    }

    #[tokio::test]
    async fn test_teardown_marks_peer_offline() {
        let (manager, _router) = manager(MeshConfig::default());
        let key = SocketKey::new("127.0.0.1", 7001);
        manager.directory.upsert_seen(&key, None).unwrap();

        manager.handle_connection_event(&ConnectionEvent::Closed {
            id: 1,
            direction: crate::transport::Direction::Outbound,
            peer: Some(key.clone()),
            closed_locally: false,
        });
        assert_eq!(manager.directory.state_of(&key), Some(PeerState::Offline));
    }
}
