//! Merkle-root anti-entropy
//!
//! A round rebuilds the local trees and broadcasts `check-roots`. Each reply
//! is compared type by type in [`SYNC_ORDER`]; only the first divergent type
//! is repaired (`get-ids`, then `get-entity` for every id missing locally).
//! A successful upsert schedules another round, and the chain ends when a
//! reply matches on every type. `SYNC_COMPLETE` is emitted once at that
//! point, and only if the chain wrote something.
//!
//! Lost replies are not retried. The next triggered round (peer online, local
//! write, periodic timer) picks the work up again.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    sync::{broadcast::error::RecvError, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    collection::SyncCollections,
    entities::{EntityType, SYNC_ORDER},
    RootSet,
};
use crate::{
    error::{MeshError, MeshResult},
    metrics,
    notifier::{ChangeKind, ChangeNotifier},
    protocol::{
        decode_payload, Action, EntityReply, GetEntityPayload, IdsReply, RequestEnvelope,
        ResponseEnvelope,
    },
    router::{MessageRouter, RequestHandler, ResponseHandler},
    transport::{Broadcaster, Connection},
};

pub struct AntiEntropySynchronizer {
    collections: SyncCollections,
    outbound: Arc<dyn Broadcaster>,
    notifier: Arc<ChangeNotifier>,
    trigger: Notify,
    min_interval: Duration,
    /// Set by an upsert, cleared when a matching round reports completion
    chain_changed: AtomicBool,
    repaired_in_chain: AtomicU64,
    rounds: AtomicU64,
    weak_self: Weak<AntiEntropySynchronizer>,
}

impl std::fmt::Debug for AntiEntropySynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiEntropySynchronizer")
            .field("collections", &self.collections)
            .field("rounds", &self.rounds())
            .finish()
    }
}

impl AntiEntropySynchronizer {
    pub fn new(
        collections: SyncCollections,
        outbound: Arc<dyn Broadcaster>,
        notifier: Arc<ChangeNotifier>,
        min_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            collections,
            outbound,
            notifier,
            trigger: Notify::new(),
            min_interval,
            chain_changed: AtomicBool::new(false),
            repaired_in_chain: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn collections(&self) -> &SyncCollections {
        &self.collections
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Round
    // ========================================================================

    /// Rebuild local trees and ask every connected peer for its roots.
    /// Returns the number of peers asked.
    pub fn run_round(&self) -> MeshResult<usize> {
        let roots = self.collections.rebuild_all()?;
        self.rounds.fetch_add(1, Ordering::Relaxed);
        metrics::record_sync_round();

        let sent = self
            .outbound
            .broadcast(&RequestEnvelope::new(Action::CheckRoots, Some(json!({}))));
        debug!(sent, roots = ?roots, "Sync round started");
        Ok(sent)
    }

    /// Ask the driver for another round. Requests made while one is pending
    /// collapse into it.
    pub fn request_round(&self) {
        self.trigger.notify_one();
    }

    // ========================================================================
    // Serving peers
    // ========================================================================

    pub fn handle_check_roots(&self) -> MeshResult<RootSet> {
        self.collections.rebuild_all()
    }

    pub fn handle_get_ids(&self, entity_type: EntityType) -> MeshResult<IdsReply> {
        let ids = self.collections.get(entity_type)?.ids()?;
        Ok(IdsReply { entity_type, ids })
    }

    pub fn handle_get_entity(&self, request: &GetEntityPayload) -> MeshResult<EntityReply> {
        let data = self
            .collections
            .get(request.entity_type)?
            .fetch(&request.id)?
            .ok_or_else(|| MeshError::EntityNotFound {
                entity_type: request.entity_type,
                id: request.id.clone(),
            })?;
        Ok(EntityReply {
            entity_type: request.entity_type,
            data,
        })
    }

    // ========================================================================
    // Repair
    // ========================================================================

    /// Compare a peer's roots with ours. Returns the type being repaired, or
    /// None when everything matches.
    pub fn on_roots_reply(&self, remote: &RootSet) -> MeshResult<Option<EntityType>> {
        let local = self.collections.rebuild_all()?;

        for ty in SYNC_ORDER {
            let Some(remote_root) = remote.get(&ty) else {
                debug!(entity_type = %ty, "Peer reported no root, treating as in sync");
                continue;
            };
            let local_root = local.get(&ty).map(String::as_str).unwrap_or_default();
            if local_root != remote_root {
                debug!(
                    entity_type = %ty,
                    local = local_root,
                    remote = %remote_root,
                    "Root mismatch, requesting ids"
                );
                self.outbound
                    .broadcast(&RequestEnvelope::new(Action::GetIds, Some(json!(ty))));
                return Ok(Some(ty));
            }
        }

        if self.chain_changed.swap(false, Ordering::AcqRel) {
            let repaired = self.repaired_in_chain.swap(0, Ordering::AcqRel);
            info!(repaired, "Collections converged");
            self.notifier
                .emit(ChangeKind::SyncComplete, json!({ "repaired": repaired }));
        }
        Ok(None)
    }

    /// Request every id the peer has and we do not. Returns how many were
    /// requested.
    pub fn on_ids_reply(&self, reply: &IdsReply) -> MeshResult<usize> {
        let collection = self.collections.get(reply.entity_type)?;
        let mut requested = 0;
        for id in &reply.ids {
            if collection.contains(id)? {
                continue;
            }
            let payload = GetEntityPayload {
                entity_type: reply.entity_type,
                id: id.clone(),
            };
            self.outbound
                .broadcast(&RequestEnvelope::with_payload(Action::GetEntity, &payload)?);
            requested += 1;
        }
        debug!(entity_type = %reply.entity_type, requested, "Requested missing entities");
        Ok(requested)
    }

    /// Store a fetched entity. Entities already present are left alone and
    /// do not count as a change.
    pub fn on_entity_reply(&self, reply: EntityReply) -> MeshResult<bool> {
        let entity_type = reply.entity_type;
        let applied = self.collections.get(entity_type)?.apply(reply.data)?;
        if applied {
            debug!(entity_type = %entity_type, "Repaired entity");
            metrics::record_entity_repaired(entity_type.as_str());
            self.repaired_in_chain.fetch_add(1, Ordering::AcqRel);
            self.chain_changed.store(true, Ordering::Release);
            self.request_round();
        }
        Ok(applied)
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    pub fn register_handlers(&self, router: &MessageRouter) {
        let weak = self.weak_self.clone();

        router.register_action(
            Action::CheckRoots,
            request_handler(weak.clone(), |s, _| {
                let roots = s.handle_check_roots()?;
                Ok(Some(ResponseEnvelope::success(
                    Action::CheckRoots,
                    Some(serde_json::to_value(roots)?),
                )))
            }),
        );
        router.register_action(
            Action::GetIds,
            request_handler(weak.clone(), |s, payload| {
                let entity_type: EntityType = decode_payload(Action::GetIds, payload)?;
                let reply = s.handle_get_ids(entity_type)?;
                Ok(Some(ResponseEnvelope::success(
                    Action::GetIds,
                    Some(serde_json::to_value(reply)?),
                )))
            }),
        );
        router.register_action(
            Action::GetEntity,
            request_handler(weak.clone(), |s, payload| {
                let request: GetEntityPayload = decode_payload(Action::GetEntity, payload)?;
                let reply = s.handle_get_entity(&request)?;
                Ok(Some(ResponseEnvelope::success(
                    Action::GetEntity,
                    Some(serde_json::to_value(reply)?),
                )))
            }),
        );

        router.register_response_handler(
            Action::CheckRoots,
            response_handler(weak.clone(), Action::CheckRoots, |s, data| {
                let remote: RootSet = decode_payload(Action::CheckRoots, data)?;
                s.on_roots_reply(&remote).map(|_| ())
            }),
        );
        router.register_response_handler(
            Action::GetIds,
            response_handler(weak.clone(), Action::GetIds, |s, data| {
                let reply: IdsReply = decode_payload(Action::GetIds, data)?;
                s.on_ids_reply(&reply).map(|_| ())
            }),
        );
        router.register_response_handler(
            Action::GetEntity,
            response_handler(weak, Action::GetEntity, |s, data| {
                let reply: EntityReply = decode_payload(Action::GetEntity, data)?;
                s.on_entity_reply(reply).map(|_| ())
            }),
        );
    }

    /// Start the round driver and the change listener that feeds it.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(this) = self.weak_self.upgrade() else {
            return Vec::new();
        };

        let driver = {
            let this = this.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.drive_rounds(cancel).await })
        };

        let mut changes = self.notifier.subscribe();
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = changes.recv() => match event {
                        Ok(event) => {
                            if matches!(event.kind, ChangeKind::PeerOnline | ChangeKind::LocalWrite) {
                                this.request_round();
                            }
                        }
                        Err(RecvError::Lagged(_)) => this.request_round(),
                        Err(RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });

        vec![driver, listener]
    }

    async fn drive_rounds(&self, cancel: CancellationToken) {
        info!("Sync round driver started");
        loop {
            tokio::select! {
                _ = self.trigger.notified() => {}
                _ = cancel.cancelled() => break,
            }
            // let triggers that arrive close together share one round
            tokio::select! {
                _ = tokio::time::sleep(self.min_interval) => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = self.run_round() {
                warn!("Sync round failed: {}", e);
            }
        }
        info!("Sync round driver stopped");
    }
}

fn request_handler<F>(weak: Weak<AntiEntropySynchronizer>, f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(&AntiEntropySynchronizer, Option<Value>) -> MeshResult<Option<ResponseEnvelope>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(
        move |_: &Arc<Connection>, payload: Option<Value>| -> MeshResult<Option<ResponseEnvelope>> {
            let sync = weak
                .upgrade()
                .ok_or_else(|| MeshError::Store("synchronizer dropped".into()))?;
            f(&sync, payload)
        },
    )
}

/// Replies with error status are logged and otherwise ignored; a missing
/// entity on one peer is normal while another peer serves it.
fn response_handler<F>(
    weak: Weak<AntiEntropySynchronizer>,
    action: Action,
    f: F,
) -> Arc<dyn ResponseHandler>
where
    F: Fn(&AntiEntropySynchronizer, Option<Value>) -> MeshResult<()> + Send + Sync + 'static,
{
    Arc::new(move |conn: &Arc<Connection>, resp: ResponseEnvelope| {
        let Some(sync) = weak.upgrade() else {
            return;
        };
        if !resp.is_success() {
            debug!(
                conn = conn.id(),
                action = %action,
                "Peer returned error: {}",
                resp.message.unwrap_or_default()
            );
            return;
        }
        if let Err(e) = f(&sync, resp.data) {
            warn!(conn = conn.id(), action = %action, "Failed to process reply: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;
    use crate::sync::{
        collection::InMemoryStores,
        entities::{ChannelMembership, Message, User},
        store::Store,
    };

    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: Mutex<Vec<RequestEnvelope>>,
    }

    impl RecordingBroadcaster {
        fn take(&self) -> Vec<RequestEnvelope> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast(&self, request: &RequestEnvelope) -> usize {
            self.sent.lock().push(request.clone());
            1
        }
    }

    fn synchronizer() -> (
        Arc<AntiEntropySynchronizer>,
        InMemoryStores,
        Arc<RecordingBroadcaster>,
        Arc<ChangeNotifier>,
    ) {
        let (collections, stores) = SyncCollections::in_memory();
        let outbound = Arc::new(RecordingBroadcaster::default());
        let notifier = Arc::new(ChangeNotifier::new());
        let sync = AntiEntropySynchronizer::new(
            collections,
            outbound.clone(),
            notifier.clone(),
            Duration::from_millis(10),
        );
        (sync, stores, outbound, notifier)
    }

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            username: id.into(),
            email: format!("{}@example.com", id),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_round_broadcasts_check_roots() {
        let (sync, _, outbound, _) = synchronizer();
        assert_eq!(sync.run_round().unwrap(), 1);
        let sent = outbound.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, "check-roots");
        assert_eq!(sync.rounds(), 1);
    }

    #[test]
    fn test_only_first_divergent_type_is_repaired() {
        let (sync, stores, outbound, _) = synchronizer();
        let (peer, peer_stores, _, _) = synchronizer();
        let now = Utc::now();
        peer_stores
            .memberships
            .upsert(ChannelMembership {
                id: "m1".into(),
                channel_id: "c1".into(),
                user_id: "u1".into(),
                joined_at: now,
            })
            .unwrap();
        peer_stores
            .messages
            .upsert(Message {
                id: "msg1".into(),
                channel_id: "c1".into(),
                author_id: "u1".into(),
                content: "hi".into(),
                sent_at: now,
            })
            .unwrap();
        assert!(stores.memberships.is_empty());

        let remote = peer.handle_check_roots().unwrap();
        let repairing = sync.on_roots_reply(&remote).unwrap();
        assert_eq!(repairing, Some(EntityType::Membership));

        let sent = outbound.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, "get-ids");
        assert_eq!(sent[0].payload, Some(json!("MEMBERSHIP")));
    }

    #[test]
    fn test_missing_remote_type_counts_as_match() {
        let (sync, stores, outbound, _) = synchronizer();
        stores.users.upsert(user("u1")).unwrap();

        let mut remote = RootSet::new();
        remote.insert(EntityType::Channel, crate::sync::merkle::EMPTY_ROOT.to_string());
        assert_eq!(sync.on_roots_reply(&remote).unwrap(), None);
        assert!(outbound.take().is_empty());
    }

    #[test]
    fn test_ids_reply_requests_only_missing() {
        let (sync, stores, outbound, _) = synchronizer();
        stores.users.upsert(user("u1")).unwrap();

        let requested = sync
            .on_ids_reply(&IdsReply {
                entity_type: EntityType::User,
                ids: vec!["u1".into(), "u2".into(), "u3".into()],
            })
            .unwrap();
        assert_eq!(requested, 2);

        let sent = outbound.take();
        let ids: Vec<Value> = sent
            .iter()
            .map(|req| req.payload.as_ref().unwrap()["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("u2"), json!("u3")]);
    }

    #[test]
    fn test_get_entity_not_found() {
        let (sync, _, _, _) = synchronizer();
        let err = sync
            .handle_get_entity(&GetEntityPayload {
                entity_type: EntityType::User,
                id: "ghost".into(),
            })
            .unwrap_err();
        assert!(matches!(err, MeshError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_repeated_entity_is_noop_and_completes_once() {
        let (sync, stores, _, notifier) = synchronizer();
        let mut events = notifier.subscribe();
        let data = serde_json::to_value(user("u1")).unwrap();

        let reply = EntityReply {
            entity_type: EntityType::User,
            data,
        };
        assert!(sync.on_entity_reply(reply.clone()).unwrap());
        assert!(!sync.on_entity_reply(reply).unwrap());
        assert_eq!(stores.users.len(), 1);

        // matching roots end the chain with a single completion
        let local = sync.handle_check_roots().unwrap();
        assert_eq!(sync.on_roots_reply(&local).unwrap(), None);
        assert_eq!(sync.on_roots_reply(&local).unwrap(), None);

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::SyncComplete);
        assert_eq!(event.payload["repaired"], 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_coalesces_triggers() {
        let (sync, _, outbound, _) = synchronizer();
        let cancel = CancellationToken::new();
        let handles = sync.spawn(cancel.clone());

        for _ in 0..5 {
            sync.request_round();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sync.rounds(), 1);
        assert_eq!(outbound.take().len(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
