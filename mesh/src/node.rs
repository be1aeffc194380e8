//! Mesh node
//!
//! Wires the directory, transport, router, membership and synchronizer
//! together and owns their background tasks.

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::MeshConfig,
    error::MeshResult,
    membership::MembershipManager,
    notifier::{ChangeKind, ChangeNotifier},
    peer_directory::{BootRole, PeerDirectory, SocketKey},
    router::MessageRouter,
    scheduler::PeriodicTask,
    sync::{AntiEntropySynchronizer, EntityType, SyncCollections},
    transport::{Broadcaster, Transport},
};

pub struct MeshNode {
    config: Arc<MeshConfig>,
    directory: Arc<PeerDirectory>,
    router: Arc<MessageRouter>,
    transport: Arc<Transport>,
    membership: Arc<MembershipManager>,
    synchronizer: Arc<AntiEntropySynchronizer>,
    notifier: Arc<ChangeNotifier>,
    cancel: CancellationToken,
    periodic: Mutex<Vec<PeriodicTask>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("local_addr", &*self.local_addr.lock())
            .field("transport", &self.transport)
            .field("peers", &self.directory.len())
            .finish()
    }
}

impl MeshNode {
    pub fn new(config: MeshConfig, collections: SyncCollections) -> MeshResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let directory = Arc::new(PeerDirectory::from_config_path(
            config.directory_path.as_deref(),
        )?);
        let notifier = Arc::new(ChangeNotifier::new());
        let router = Arc::new(MessageRouter::new());
        let transport = Transport::new(config.clone(), router.clone(), cancel.child_token());

        let membership = MembershipManager::new(
            config.clone(),
            directory.clone(),
            transport.clone(),
            notifier.clone(),
            cancel.child_token(),
        );
        membership.register_handlers(&router);

        let outbound: Arc<dyn Broadcaster> = transport.clone();
        let synchronizer = AntiEntropySynchronizer::new(
            collections,
            outbound,
            notifier.clone(),
            config.sync_min_interval(),
        );
        synchronizer.register_handlers(&router);

        Ok(Self {
            config,
            directory,
            router,
            transport,
            membership,
            synchronizer,
            notifier,
            cancel,
            periodic: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        })
    }

    /// Resolve identity, listen, start timers and listeners, then join the
    /// mesh through the seed if one is configured. Returns the bound address.
    pub async fn start(&self) -> MeshResult<SocketAddr> {
        let (listener, bound) = self.transport.bind(self.config.listen_port).await?;
        let local_key = SocketKey::new(self.config.advertise_host.clone(), bound.port());

        let role = self.membership.resolve_identity(&local_key)?;
        self.transport.serve(listener);
        *self.local_addr.lock() = Some(bound);

        {
            let mut background = self.background.lock();
            background.extend(self.membership.spawn_disconnect_listener());
            background.extend(self.synchronizer.spawn(self.cancel.child_token()));
        }
        {
            let mut periodic = self.periodic.lock();
            periodic.extend(self.membership.start_timers());
            if let Some(every) = self.config.sync_interval() {
                let sync = self.synchronizer.clone();
                periodic.push(PeriodicTask::spawn(
                    "sync-round",
                    every,
                    every,
                    self.cancel.child_token(),
                    move || {
                        let sync = sync.clone();
                        async move { sync.request_round() }
                    },
                ));
            }
        }

        info!(
            addr = %local_key,
            role = ?role,
            "Mesh node started"
        );

        match (&self.config.seed, role) {
            (Some(seed), _) => self.spawn_bootstrap(seed.socket_key()),
            (None, BootRole::Recovered) => self.spawn_liveness_round(),
            (None, _) => {}
        }

        Ok(bound)
    }

    fn spawn_bootstrap(&self, seed: SocketKey) {
        let membership = self.membership.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = membership.bootstrap(&seed).await {
                // fall back to whatever the directory already knows
                warn!(seed = %seed, "Bootstrap failed: {}", e);
                membership.run_liveness_round().await;
            }
        });
        self.background.lock().push(handle);
    }

    fn spawn_liveness_round(&self) {
        let membership = self.membership.clone();
        let handle = tokio::spawn(async move { membership.run_liveness_round().await });
        self.background.lock().push(handle);
    }

    /// Stop every task and close every connection.
    pub async fn shutdown(&self) {
        info!("Shutting down mesh node");
        self.cancel.cancel();
        self.transport.shutdown();

        let periodic: Vec<PeriodicTask> = std::mem::take(&mut *self.periodic.lock());
        for task in periodic {
            task.stop().await;
        }
        let background: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in background {
            handle.abort();
        }
    }

    /// Announce a local mutation of `entity_type`; triggers a sync round.
    pub fn record_local_write(&self, entity_type: EntityType) {
        self.notifier
            .emit(ChangeKind::LocalWrite, json!({ "type": entity_type }));
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn local_key(&self) -> Option<SocketKey> {
        self.membership.local_key()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn membership(&self) -> &Arc<MembershipManager> {
        &self.membership
    }

    pub fn synchronizer(&self) -> &Arc<AntiEntropySynchronizer> {
        &self.synchronizer
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
