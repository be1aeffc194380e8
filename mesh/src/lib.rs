//! Peer mesh for a federated chat backend
//!
//! This crate keeps a set of independent server nodes connected and their
//! replicated data eventually consistent:
//! - Durable peer directory with ONLINE/OFFLINE/CONNECTING liveness state
//! - Newline-delimited JSON transport over TCP with bounded workers and
//!   budgeted reconnects
//! - Bootstrap through a seed, liveness pings and passive gossip
//! - Merkle-root anti-entropy over users, channels, memberships and messages,
//!   repaired in dependency order

pub mod config;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod notifier;
pub mod peer_directory;
pub mod protocol;
pub mod router;
pub mod scheduler;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::{MeshConfig, SeedConfig};
pub use error::{MeshError, MeshResult};
pub use membership::MembershipManager;
pub use node::MeshNode;
pub use notifier::{ChangeEvent, ChangeKind, ChangeListener, ChangeNotifier};
pub use peer_directory::{BootRole, PeerDirectory, PeerIdentity, PeerState, SocketKey};
pub use protocol::{Action, Envelope, RequestEnvelope, ResponseEnvelope};
pub use router::MessageRouter;
pub use sync::{
    AntiEntropySynchronizer, Channel, ChannelMembership, EntityType, InMemoryStore,
    InMemoryStores, Message, Store, SyncCollections, SyncEntity, User, SYNC_ORDER,
};
pub use transport::{Broadcaster, Connection, ConnectionEvent, Direction, Transport};
