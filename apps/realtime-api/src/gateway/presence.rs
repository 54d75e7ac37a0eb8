//! Per-user presence derived from the session registry, plus explicit
//! away/dnd overrides.
//!
//! Presence is per-**user**, not per-connection. A user goes offline only when
//! the last of their connections closes; closing one of several devices emits
//! nothing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parley_common::protocol::PresenceEntry;
use parley_common::{PresenceStatus, ServerEvent};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::registry::{SessionRegistry, Transition};
use super::router::RoomRouter;
use crate::db::status::StatusStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("user has no live connection")]
    NotConnected,
    #[error("status `{0}` cannot be set explicitly")]
    NotSettable(PresenceStatus),
}

/// Read side of presence, for request handlers.
#[async_trait]
pub trait PresenceQuery: Send + Sync {
    async fn current_status(&self, user_id: &str) -> PresenceStatus;
}

pub struct PresenceBroadcaster {
    registry: Arc<SessionRegistry>,
    router: Arc<RoomRouter>,
    store: Arc<dyn StatusStore>,
    /// Explicit away/dnd for users that currently have connections. Cleared
    /// on every connection-driven transition.
    overrides: DashMap<String, PresenceStatus>,
    /// One async lock per user with a transition in flight.
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PresenceBroadcaster {
    pub fn new(
        registry: Arc<SessionRegistry>,
        router: Arc<RoomRouter>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        Self {
            registry,
            router,
            store,
            overrides: DashMap::new(),
            user_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Serialize the whole transition (registry mutation, persistence and
    /// broadcast) for one user.
    async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .user_locks
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone();
        lock.lock_owned().await
    }

    fn release_user(&self, user_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        // Only the map holds the Arc once nobody is waiting on it. Clones are
        // taken under the shard lock, so this check cannot race a new waiter.
        self.user_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Register a connection; broadcasts only on the user's first connection.
    pub async fn connect(&self, user_id: &str, connection_id: &str) -> Transition {
        let guard = self.lock_user(user_id).await;
        let transition = self.registry.add_connection(user_id, connection_id);
        if transition == Transition::CameOnline {
            let status = self.restored_status(user_id).await;
            if status == PresenceStatus::Online {
                self.overrides.remove(user_id);
            } else {
                self.overrides.insert(user_id.to_string(), status);
            }
            self.persist(user_id, status).await;
            tracing::info!(%user_id, %status, "user online");
            self.router.broadcast_all(ServerEvent::UserOnline {
                user_id: user_id.to_string(),
            });
            self.router.broadcast_all(ServerEvent::StatusUpdate {
                user_id: user_id.to_string(),
                status,
            });
        }
        self.release_user(user_id, guard);
        transition
    }

    /// Unregister a connection; broadcasts only when it was the last one.
    pub async fn disconnect(&self, user_id: &str, connection_id: &str) -> Transition {
        let guard = self.lock_user(user_id).await;
        let transition = self.registry.remove_connection(user_id, connection_id);
        if transition == Transition::WentOffline {
            self.overrides.remove(user_id);
            self.persist(user_id, PresenceStatus::Offline).await;
            tracing::info!(%user_id, "user offline");
            self.router.broadcast_all(ServerEvent::UserOffline {
                user_id: user_id.to_string(),
            });
            self.router.broadcast_all(ServerEvent::StatusUpdate {
                user_id: user_id.to_string(),
                status: PresenceStatus::Offline,
            });
        }
        self.release_user(user_id, guard);
        transition
    }

    /// Explicit status change from the client (`online`, `away` or `dnd`).
    ///
    /// Returns the previous status if it changed.
    pub async fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<Option<PresenceStatus>, PresenceError> {
        if status == PresenceStatus::Offline {
            return Err(PresenceError::NotSettable(status));
        }

        let guard = self.lock_user(user_id).await;
        let result = self.apply_override(user_id, status).await;
        self.release_user(user_id, guard);
        result
    }

    async fn apply_override(
        &self,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<Option<PresenceStatus>, PresenceError> {
        if !self.registry.is_online(user_id) {
            return Err(PresenceError::NotConnected);
        }

        let previous = self.live_status(user_id);
        if previous == status {
            return Ok(None);
        }

        if status == PresenceStatus::Online {
            self.overrides.remove(user_id);
        } else {
            self.overrides.insert(user_id.to_string(), status);
        }
        self.persist(user_id, status).await;
        self.router.broadcast_all(ServerEvent::StatusUpdate {
            user_id: user_id.to_string(),
            status,
        });
        Ok(Some(previous))
    }

    /// Status to come online with. An away/dnd that was never followed by an
    /// offline write (the previous process died with the user connected) is
    /// carried over; anything else starts online.
    async fn restored_status(&self, user_id: &str) -> PresenceStatus {
        match self.store.get_status(user_id).await {
            Ok(Some(stored)) if matches!(stored.status, PresenceStatus::Away | PresenceStatus::Dnd) => {
                tracing::debug!(%user_id, status = %stored.status, "restoring persisted status");
                stored.status
            }
            Ok(_) => PresenceStatus::Online,
            Err(err) => {
                tracing::warn!(%user_id, ?err, "failed to read persisted status");
                PresenceStatus::Online
            }
        }
    }

    /// Persist a status. Failures are logged and otherwise ignored: the
    /// broadcast still goes out and the next transition overwrites the row.
    async fn persist(&self, user_id: &str, status: PresenceStatus) {
        if let Err(err) = self.store.set_status(user_id, status, Utc::now()).await {
            tracing::warn!(%user_id, %status, ?err, "failed to persist presence status");
        }
    }

    fn live_status(&self, user_id: &str) -> PresenceStatus {
        if !self.registry.is_online(user_id) {
            return PresenceStatus::Offline;
        }
        self.overrides
            .get(user_id)
            .map(|s| *s.value())
            .unwrap_or(PresenceStatus::Online)
    }

    /// Every user with at least one connection and their current status.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.registry
            .online_users()
            .into_iter()
            .map(|user_id| {
                let status = self.live_status(&user_id);
                PresenceEntry { user_id, status }
            })
            .filter(|entry| entry.status != PresenceStatus::Offline)
            .collect()
    }
}

#[async_trait]
impl PresenceQuery for PresenceBroadcaster {
    async fn current_status(&self, user_id: &str) -> PresenceStatus {
        self.live_status(user_id)
    }
}
