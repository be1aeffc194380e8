//! Replicated entity types
//!
//! Four collections are replicated across the mesh. Their sync order follows
//! referential dependency: memberships reference users and channels, messages
//! reference channels.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Replicated collection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    User,
    Channel,
    Membership,
    Message,
}

/// Repair order. A round never looks past the first divergent type.
pub const SYNC_ORDER: [EntityType; 4] = [
    EntityType::User,
    EntityType::Channel,
    EntityType::Membership,
    EntityType::Message,
];

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "USER",
            EntityType::Channel => "CHANNEL",
            EntityType::Membership => "MEMBERSHIP",
            EntityType::Message => "MESSAGE",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(EntityType::User),
            "CHANNEL" => Ok(EntityType::Channel),
            "MEMBERSHIP" => Ok(EntityType::Membership),
            "MESSAGE" => Ok(EntityType::Message),
            other => Err(MeshError::invalid_payload(
                "entity-type",
                format!("unknown entity type '{}'", other),
            )),
        }
    }
}

/// An entity that can live in a replicated collection.
///
/// `canonical_bytes` must be stable across replicas: two equal values always
/// produce the same bytes. Serializing the struct with serde_json keeps fields
/// in declaration order, which is what the default implementation relies on.
pub trait SyncEntity:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;

    fn canonical_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMembership {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl SyncEntity for User {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn id(&self) -> &str {
        &self.id
    }
}

impl SyncEntity for Channel {
    const ENTITY_TYPE: EntityType = EntityType::Channel;

    fn id(&self) -> &str {
        &self.id
    }
}

impl SyncEntity for ChannelMembership {
    const ENTITY_TYPE: EntityType = EntityType::Membership;

    fn id(&self) -> &str {
        &self.id
    }
}

impl SyncEntity for Message {
    const ENTITY_TYPE: EntityType = EntityType::Message;

    fn id(&self) -> &str {
        &self.id
    }
}
