//! Per-connection gateway state and the process-wide connection table.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use parley_common::id::{prefix, prefixed_ulid};
use parley_common::{ServerEvent, Topic};
use tokio::sync::mpsc;

use crate::auth::tokens::AuthenticatedUser;

pub type Outbound = mpsc::Receiver<Arc<ServerEvent>>;

/// Outcome of handing an event to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the event was dropped for this connection only.
    Lagged,
    /// The transport task is gone; the subscription is dead.
    Closed,
}

/// State for a single authenticated transport connection.
pub struct Connection {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Authenticated user ID. Never changes for the life of the connection.
    pub user_id: String,
    pub display_name: String,
    pub authenticated_at: DateTime<Utc>,
    outbound: mpsc::Sender<Arc<ServerEvent>>,
    /// Topics this connection has an open `typing_start` on.
    typing: Mutex<HashSet<Topic>>,
}

impl Connection {
    pub fn new(user: AuthenticatedUser, queue_capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let conn = Self {
            connection_id: prefixed_ulid(prefix::CONNECTION),
            user_id: user.user_id,
            display_name: user.display_name,
            authenticated_at: Utc::now(),
            outbound: tx,
            typing: Mutex::new(HashSet::new()),
        };
        (conn, rx)
    }

    pub fn personal_topic(&self) -> Topic {
        Topic::user(self.user_id.clone())
    }

    /// Queue an event without waiting. Never blocks the caller on a slow client.
    pub fn deliver(&self, event: Arc<ServerEvent>) -> Delivery {
        match self.outbound.try_send(event) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    event = event.name(),
                    "outbound queue full, dropping event"
                );
                Delivery::Lagged
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Record a typing start/stop. Returns whether the state changed.
    pub fn set_typing(&self, topic: &Topic, typing: bool) -> bool {
        let mut set = self.typing.lock();
        if typing {
            set.insert(topic.clone())
        } else {
            set.remove(topic)
        }
    }

    /// Drain the open typing topics (used on close).
    pub fn take_typing(&self) -> Vec<Topic> {
        self.typing.lock().drain().collect()
    }
}

/// All live connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionTable {
    inner: DashMap<String, Arc<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.inner.insert(conn.connection_id.clone(), conn);
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.get(connection_id).map(|c| c.value().clone())
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.remove(connection_id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of every live connection. Guards are released before return.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.iter().map(|c| c.value().clone()).collect()
    }
}
