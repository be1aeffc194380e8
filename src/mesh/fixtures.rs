use std::path::Path;

use anyhow::Context;
use chat_mesh::{Channel, ChannelMembership, InMemoryStores, Message, Store, User};
use serde::{Deserialize, Serialize};

/// Rows to seed a node's stores with before it joins the mesh
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Fixtures {
    pub users: Vec<User>,
    pub channels: Vec<Channel>,
    pub memberships: Vec<ChannelMembership>,
    pub messages: Vec<Message>,
}

impl Fixtures {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read fixtures {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid fixtures file {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.users.len() + self.channels.len() + self.memberships.len() + self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upsert every row. Returns how many rows changed a store.
    pub fn apply(self, stores: &InMemoryStores) -> anyhow::Result<usize> {
        let mut changed = 0;
        for user in self.users {
            changed += usize::from(stores.users.upsert(user)?);
        }
        for channel in self.channels {
            changed += usize::from(stores.channels.upsert(channel)?);
        }
        for membership in self.memberships {
            changed += usize::from(stores.memberships.upsert(membership)?);
        }
        for message in self.messages {
            changed += usize::from(stores.messages.upsert(message)?);
        }
        Ok(changed)
    }
}
