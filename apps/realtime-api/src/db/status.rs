//! Persisted presence status (the `StatusStore` collaborator).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::PresenceStatus;
use serde::{Deserialize, Serialize};

use super::kv::{self, KeyValueStore};
use super::StoreError;

/// Last persisted status of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredStatus {
    pub status: PresenceStatus,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_status(&self, user_id: &str) -> Result<Option<StoredStatus>, StoreError>;
}

/// `StatusStore` on top of a [`KeyValueStore`].
pub struct KvStatusStore {
    kv: Arc<dyn KeyValueStore>,
}

impl KvStatusStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }
}

fn status_key(user_id: &str) -> String {
    format!("presence:status:{user_id}")
}

#[async_trait]
impl StatusStore for KvStatusStore {
    async fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let value = StoredStatus {
            status,
            updated_at: at,
        };
        kv::set_json(self.kv.as_ref(), &status_key(user_id), &value).await
    }

    async fn get_status(&self, user_id: &str) -> Result<Option<StoredStatus>, StoreError> {
        kv::get_json(self.kv.as_ref(), &status_key(user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    #[tokio::test]
    async fn kv_status_store_persists_latest_status() {
        let store = KvStatusStore::new(Arc::new(MemoryStore::new()));
        assert!(store.get_status("u1").await.unwrap().is_none());

        let t0 = Utc::now();
        store.set_status("u1", PresenceStatus::Online, t0).await.unwrap();
        store.set_status("u1", PresenceStatus::Dnd, t0).await.unwrap();

        let stored = store.get_status("u1").await.unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Dnd);
        assert_eq!(stored.updated_at, t0);
    }
}
