//! Replicated data and anti-entropy synchronization

mod collection;
mod entities;
pub mod merkle;
mod store;
mod synchronizer;

use std::collections::BTreeMap;

pub use collection::{InMemoryStores, ReplicatedCollection, SyncCollection, SyncCollections};
pub use entities::{
    Channel, ChannelMembership, EntityType, Message, SyncEntity, User, SYNC_ORDER,
};
pub use merkle::{MerkleLeaf, MerkleTree, EMPTY_ROOT};
pub use store::{InMemoryStore, Store};
pub use synchronizer::AntiEntropySynchronizer;

/// Root hash per collection, as carried by `check-roots` replies
pub type RootSet = BTreeMap<EntityType, String>;
