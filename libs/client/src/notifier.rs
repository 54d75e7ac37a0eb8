//! Session propagation between client instances of the same origin.
//!
//! The canonical session lives under [`SESSION_KEY`] in shared storage,
//! wrapped in an envelope naming the instance that wrote it. Instances adopt
//! changes written by others, ignore their own echoes, and periodically
//! re-read the key in case a notification was missed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_common::id::{prefix, prefixed_ulid};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::ClientConfig;
use crate::manager::ConnectionManager;
use crate::storage::{SharedStorage, StorageChange, StorageError};

pub const SESSION_KEY: &str = "parley.session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: String,
    session: Option<SessionRecord>,
}

pub struct CrossInstanceNotifier {
    inner: Arc<Inner>,
}

struct Inner {
    storage: Arc<dyn SharedStorage>,
    instance_id: String,
    reconcile_interval: Duration,
    session: watch::Sender<Option<SessionRecord>>,
    manager: Option<ConnectionManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CrossInstanceNotifier {
    /// Adopted session changes are forwarded to `manager` as token changes.
    pub fn new(
        storage: Arc<dyn SharedStorage>,
        config: &ClientConfig,
        manager: Option<ConnectionManager>,
    ) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                storage,
                instance_id: prefixed_ulid(prefix::INSTANCE),
                reconcile_interval: config.reconcile_interval,
                session,
                manager,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn current(&self) -> Option<SessionRecord> {
        self.inner.session.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<SessionRecord>> {
        self.inner.session.subscribe()
    }

    /// Adopt whatever session is stored now, then follow changes.
    pub async fn start(&self) -> Result<(), StorageError> {
        let changes = self.inner.storage.subscribe();
        self.inner.reconcile().await?;

        let listener = tokio::spawn(self.inner.clone().listen(changes));
        let reconciler = tokio::spawn(self.inner.clone().reconcile_periodically());
        self.inner.tasks.lock().extend([listener, reconciler]);

        tracing::debug!(instance_id = %self.inner.instance_id, "cross-instance notifier started");
        Ok(())
    }

    /// Publish a login to every instance and adopt it here.
    pub async fn login(&self, session: SessionRecord) -> Result<(), StorageError> {
        self.inner.publish(Some(session.clone())).await?;
        self.inner.adopt(Some(session));
        Ok(())
    }

    /// Publish a logout to every instance and drop the session here.
    pub async fn logout(&self) -> Result<(), StorageError> {
        self.inner.publish(None).await?;
        self.inner.adopt(None);
        Ok(())
    }

    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for CrossInstanceNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    async fn publish(&self, session: Option<SessionRecord>) -> Result<(), StorageError> {
        let envelope = Envelope {
            origin: self.instance_id.clone(),
            session,
        };
        let json = serde_json::to_string(&envelope)?;
        self.storage.write(SESSION_KEY, &json).await
    }

    async fn listen(self: Arc<Self>, mut changes: broadcast::Receiver<StorageChange>) {
        loop {
            match changes.recv().await {
                Ok(change) if change.key == SESSION_KEY => self.on_change(change.value.as_deref()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "missed storage notifications, reconciling");
                    if let Err(err) = self.reconcile().await {
                        tracing::warn!(%err, "reconcile failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn reconcile_periodically(self: Arc<Self>) {
        let mut ticker = time::interval_at(
            Instant::now() + self.reconcile_interval,
            self.reconcile_interval,
        );
        loop {
            ticker.tick().await;
            if let Err(err) = self.reconcile().await {
                tracing::warn!(%err, "reconcile failed");
            }
        }
    }

    /// Re-read the canonical key. The stored value wins whoever wrote it.
    async fn reconcile(&self) -> Result<(), StorageError> {
        let stored = self.storage.read(SESSION_KEY).await?;
        match stored.as_deref().map(serde_json::from_str::<Envelope>) {
            None => self.adopt(None),
            Some(Ok(envelope)) => self.adopt(envelope.session),
            Some(Err(err)) => tracing::warn!(%err, "ignoring unreadable stored session"),
        }
        Ok(())
    }

    fn on_change(&self, value: Option<&str>) {
        let Some(value) = value else {
            self.adopt(None);
            return;
        };
        match serde_json::from_str::<Envelope>(value) {
            Ok(envelope) if envelope.origin == self.instance_id => {}
            Ok(envelope) => {
                tracing::debug!(origin = %envelope.origin, "session changed in another instance");
                self.adopt(envelope.session);
            }
            Err(err) => tracing::warn!(%err, "ignoring unreadable session notification"),
        }
    }

    fn adopt(&self, session: Option<SessionRecord>) {
        let changed = self.session.send_if_modified(|current| {
            if *current == session {
                return false;
            }
            *current = session.clone();
            true
        });
        if !changed {
            return;
        }

        match &session {
            Some(s) => tracing::info!(user_id = %s.user_id, "session adopted"),
            None => tracing::info!("session dropped"),
        }
        if let Some(manager) = &self.manager {
            manager.set_token(session.map(|s| s.token));
        }
    }
}
