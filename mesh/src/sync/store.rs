//! Entity storage capability
//!
//! The mesh never owns persistence. It reads and upserts entities through
//! [`Store`], one instance per entity type. Implementations must tolerate
//! concurrent reads and repeated upserts of the same entity.

use dashmap::DashMap;

use super::entities::SyncEntity;
use crate::error::MeshResult;

pub trait Store<T: SyncEntity>: Send + Sync {
    fn find_all(&self) -> MeshResult<Vec<T>>;

    fn find_by_id(&self, id: &str) -> MeshResult<Option<T>>;

    /// Insert or replace. Returns true when the stored value changed.
    fn upsert(&self, entity: T) -> MeshResult<bool>;
}

/// DashMap-backed store
#[derive(Debug)]
pub struct InMemoryStore<T: SyncEntity> {
    rows: DashMap<String, T>,
}

impl<T: SyncEntity> InMemoryStore<T> {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    pub fn with_rows(rows: impl IntoIterator<Item = T>) -> Self {
        let store = Self::new();
        for row in rows {
            store.rows.insert(row.id().to_string(), row);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<T: SyncEntity> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SyncEntity> Store<T> for InMemoryStore<T> {
    fn find_all(&self) -> MeshResult<Vec<T>> {
        Ok(self.rows.iter().map(|entry| entry.value().clone()).collect())
    }

    fn find_by_id(&self, id: &str) -> MeshResult<Option<T>> {
        Ok(self.rows.get(id).map(|entry| entry.value().clone()))
    }

    fn upsert(&self, entity: T) -> MeshResult<bool> {
        let id = entity.id().to_string();
        match self.rows.insert(id, entity.clone()) {
            Some(previous) => Ok(previous != entity),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::sync::entities::Channel;

    fn channel(id: &str, name: &str) -> Channel {
        Channel {
            id: id.into(),
            name: name.into(),
            owner_id: "u1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_reports_change() {
        let store = InMemoryStore::new();
        let general = channel("c1", "general");

        assert!(store.upsert(general.clone()).unwrap());
        assert!(!store.upsert(general.clone()).unwrap());
        assert_eq!(store.len(), 1);

        let renamed = Channel {
            name: "lobby".into(),
            ..general
        };
        assert!(store.upsert(renamed).unwrap());
        assert_eq!(store.find_by_id("c1").unwrap().unwrap().name, "lobby");
    }

    fn upsert_all<T: SyncEntity>(store: &InMemoryStore<T>, rows: Vec<T>) -> usize {
        rows.into_iter()
            .filter(|row| store.upsert(row.clone()).unwrap())
            .count()
    }

    #[test]
    fn test_generic_upsert_through_trait() {
        let store = InMemoryStore::new();
        let rows = vec![channel("c1", "a"), channel("c2", "b")];
        assert_eq!(upsert_all(&store, rows.clone()), 2);
        assert_eq!(upsert_all(&store, rows), 0);
    }

    #[test]
    fn test_find_missing() {
        let store: InMemoryStore<Channel> = InMemoryStore::with_rows(vec![channel("c1", "a")]);
        assert!(store.find_by_id("c2").unwrap().is_none());
        assert_eq!(store.find_all().unwrap().len(), 1);
    }
}
