//! Replicated collections
//!
//! A [`SyncCollection`] wraps a typed store and builds a Merkle tree over
//! it on demand. The synchronizer only sees the type-erased [`ReplicatedCollection`]
//! view, which speaks `serde_json::Value` at the wire boundary.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use tracing::debug;

use super::{
    entities::{Channel, ChannelMembership, EntityType, Message, SyncEntity, User, SYNC_ORDER},
    merkle::{MerkleLeaf, MerkleTree},
    store::{InMemoryStore, Store},
    RootSet,
};
use crate::error::{MeshError, MeshResult};

pub trait ReplicatedCollection: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Rebuild the tree from the store and return the new root.
    fn rebuild(&self) -> MeshResult<String>;

    /// Current ids, read from the store
    fn ids(&self) -> MeshResult<Vec<String>>;

    fn contains(&self, id: &str) -> MeshResult<bool>;

    fn fetch(&self, id: &str) -> MeshResult<Option<Value>>;

    /// Store a remote entity unless one with the same id is already present.
    /// Returns true when the store was written.
    fn apply(&self, data: Value) -> MeshResult<bool>;
}

pub struct SyncCollection<T: SyncEntity> {
    store: Arc<dyn Store<T>>,
}

impl<T: SyncEntity> SyncCollection<T> {
    pub fn new(store: Arc<dyn Store<T>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store<T>> {
        &self.store
    }
}

impl<T: SyncEntity> ReplicatedCollection for SyncCollection<T> {
    fn entity_type(&self) -> EntityType {
        T::ENTITY_TYPE
    }

    fn rebuild(&self) -> MeshResult<String> {
        let leaves = self
            .store
            .find_all()?
            .iter()
            .map(|entity| Ok(MerkleLeaf::new(entity.id(), &entity.canonical_bytes()?)))
            .collect::<MeshResult<Vec<_>>>()?;

        let tree = MerkleTree::build(leaves);
        let root = tree.root().to_string();
        debug!(
            entity_type = %T::ENTITY_TYPE,
            entities = tree.len(),
            root = %root,
            "Rebuilt merkle tree"
        );
        Ok(root)
    }

    fn ids(&self) -> MeshResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .store
            .find_all()?
            .iter()
            .map(|entity| entity.id().to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn contains(&self, id: &str) -> MeshResult<bool> {
        Ok(self.store.find_by_id(id)?.is_some())
    }

    fn fetch(&self, id: &str) -> MeshResult<Option<Value>> {
        match self.store.find_by_id(id)? {
            Some(entity) => Ok(Some(serde_json::to_value(entity)?)),
            None => Ok(None),
        }
    }

    fn apply(&self, data: Value) -> MeshResult<bool> {
        let entity: T = serde_json::from_value(data).map_err(|e| {
            MeshError::invalid_payload(
                "get-entity",
                format!("cannot decode {} entity: {}", T::ENTITY_TYPE, e),
            )
        })?;

        if self.store.find_by_id(entity.id())?.is_some() {
            return Ok(false);
        }
        self.store.upsert(entity)
    }
}

/// The four replicated collections, keyed by type
#[derive(Clone)]
pub struct SyncCollections {
    collections: BTreeMap<EntityType, Arc<dyn ReplicatedCollection>>,
}

impl std::fmt::Debug for SyncCollections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCollections")
            .field("types", &self.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SyncCollections {
    pub fn new(
        users: Arc<dyn Store<User>>,
        channels: Arc<dyn Store<Channel>>,
        memberships: Arc<dyn Store<ChannelMembership>>,
        messages: Arc<dyn Store<Message>>,
    ) -> Self {
        let mut collections: BTreeMap<EntityType, Arc<dyn ReplicatedCollection>> =
            BTreeMap::new();
        collections.insert(EntityType::User, Arc::new(SyncCollection::new(users)));
        collections.insert(EntityType::Channel, Arc::new(SyncCollection::new(channels)));
        collections.insert(
            EntityType::Membership,
            Arc::new(SyncCollection::new(memberships)),
        );
        collections.insert(EntityType::Message, Arc::new(SyncCollection::new(messages)));
        Self { collections }
    }

    /// Collections over fresh in-memory stores
    pub fn in_memory() -> (Self, InMemoryStores) {
        let stores = InMemoryStores::default();
        (stores.collections(), stores)
    }

    pub fn get(&self, entity_type: EntityType) -> MeshResult<&Arc<dyn ReplicatedCollection>> {
        self.collections
            .get(&entity_type)
            .ok_or_else(|| MeshError::Store(format!("no collection registered for {}", entity_type)))
    }

    /// Rebuild every tree in sync order and return the roots.
    pub fn rebuild_all(&self) -> MeshResult<RootSet> {
        let mut roots = RootSet::new();
        for ty in SYNC_ORDER {
            roots.insert(ty, self.get(ty)?.rebuild()?);
        }
        Ok(roots)
    }
}

/// Concrete handles on the in-memory stores behind [`SyncCollections::in_memory`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryStores {
    pub users: Arc<InMemoryStore<User>>,
    pub channels: Arc<InMemoryStore<Channel>>,
    pub memberships: Arc<InMemoryStore<ChannelMembership>>,
    pub messages: Arc<InMemoryStore<Message>>,
}

impl InMemoryStores {
    pub fn collections(&self) -> SyncCollections {
        SyncCollections::new(
            self.users.clone(),
            self.channels.clone(),
            self.memberships.clone(),
            self.messages.clone(),
        )
    }
}
