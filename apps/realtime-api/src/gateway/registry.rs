//! Per-user session sets. Presence transitions are derived from set
//! cardinality: 0→1 is "came online", 1→0 is "went offline".

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Presence-relevant effect of a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
    Unchanged,
}

/// Shared registry of every user's active connections.
///
/// Each mutation runs under the DashMap shard lock for its key, so adds and
/// removes for one user are applied one at a time.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, HashSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection into the user's session set. Re-adding a known
    /// connection is a no-op.
    pub fn add_connection(&self, user_id: &str, connection_id: &str) -> Transition {
        let mut set = self.sessions.entry(user_id.to_string()).or_default();
        if set.insert(connection_id.to_string()) && set.len() == 1 {
            Transition::CameOnline
        } else {
            Transition::Unchanged
        }
    }

    /// Remove a connection. The entry is destroyed when the set empties.
    pub fn remove_connection(&self, user_id: &str, connection_id: &str) -> Transition {
        match self.sessions.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().remove(connection_id) {
                    return Transition::Unchanged;
                }
                if entry.get().is_empty() {
                    entry.remove();
                    Transition::WentOffline
                } else {
                    Transition::Unchanged
                }
            }
            Entry::Vacant(_) => Transition::Unchanged,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.sessions.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<String> {
        self.sessions
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn online_users(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}
