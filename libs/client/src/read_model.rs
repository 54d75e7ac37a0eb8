//! Local, advisory view of presence and typing built from gateway events.
//!
//! Updates are applied last-write-wins in arrival order. Nothing here is
//! authoritative; the server may have moved on.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use parley_common::protocol::{ReadyPayload, TypingPayload};
use parley_common::{PresenceStatus, ServerEvent, Topic};
use tokio::time::Instant;

pub struct ReadModel {
    statuses: Mutex<HashMap<String, PresenceStatus>>,
    /// topic → user id → last `user_typing` seen.
    typing: Mutex<HashMap<Topic, HashMap<String, Instant>>>,
    typing_expiry: Duration,
}

impl ReadModel {
    pub fn new(typing_expiry: Duration) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            typing: Mutex::new(HashMap::new()),
            typing_expiry,
        }
    }

    /// Replace the presence view with the snapshot carried by `ready`.
    pub fn seed(&self, ready: &ReadyPayload) {
        let mut statuses = self.statuses.lock();
        statuses.clear();
        statuses.extend(
            ready
                .presences
                .iter()
                .map(|p| (p.user_id.clone(), p.status)),
        );
        self.typing.lock().clear();
    }

    pub fn apply(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Ready(ready) => self.seed(ready),
            ServerEvent::UserOnline { user_id } => self.set_status(user_id, PresenceStatus::Online),
            ServerEvent::UserOffline { user_id } => {
                self.set_status(user_id, PresenceStatus::Offline);
                self.forget_typist(user_id);
            }
            ServerEvent::StatusUpdate { user_id, status } => self.set_status(user_id, *status),
            ServerEvent::Typing(payload) => {
                self.typing
                    .lock()
                    .entry(payload.target.topic())
                    .or_default()
                    .insert(payload.user_id.clone(), Instant::now());
            }
            ServerEvent::StopTyping(payload) => self.stop_typing(payload),
            ServerEvent::NewMessage(_) => {}
        }
    }

    fn set_status(&self, user_id: &str, status: PresenceStatus) {
        self.statuses.lock().insert(user_id.to_string(), status);
    }

    fn stop_typing(&self, payload: &TypingPayload) {
        let topic = payload.target.topic();
        let mut typing = self.typing.lock();
        if let Some(users) = typing.get_mut(&topic) {
            users.remove(&payload.user_id);
            if users.is_empty() {
                typing.remove(&topic);
            }
        }
    }

    fn forget_typist(&self, user_id: &str) {
        let mut typing = self.typing.lock();
        typing.retain(|_, users| {
            users.remove(user_id);
            !users.is_empty()
        });
    }

    /// Last known status; users never seen are offline.
    pub fn status(&self, user_id: &str) -> PresenceStatus {
        self.statuses
            .lock()
            .get(user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn statuses(&self) -> HashMap<String, PresenceStatus> {
        self.statuses.lock().clone()
    }

    /// Users currently shown as typing in `topic`, oldest first. Entries not
    /// refreshed within the expiry window are dropped.
    pub fn typing_in(&self, topic: &Topic) -> Vec<String> {
        let now = Instant::now();
        let mut typing = self.typing.lock();
        let Some(users) = typing.get_mut(topic) else {
            return Vec::new();
        };
        users.retain(|_, seen| now.duration_since(*seen) < self.typing_expiry);

        let mut live: Vec<(&String, &Instant)> = users.iter().collect();
        live.sort_by_key(|(_, seen)| **seen);
        let names = live.into_iter().map(|(user, _)| user.clone()).collect();
        if users.is_empty() {
            typing.remove(topic);
        }
        names
    }

    /// Drop everything (used when the connection goes away).
    pub fn clear(&self) {
        self.statuses.lock().clear();
        self.typing.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use parley_common::protocol::PresenceEntry;
    use parley_common::RoomTarget;

    use super::*;

    fn typing(user: &str) -> TypingPayload {
        TypingPayload {
            target: RoomTarget::Dm("42".into()),
            user_id: user.into(),
            username: user.into(),
        }
    }

    #[test]
    fn seeded_from_ready_then_last_write_wins() {
        let model = ReadModel::new(Duration::from_secs(5));
        model.seed(&ReadyPayload {
            user_id: "me".into(),
            connection_id: "conn_1".into(),
            presences: vec![PresenceEntry {
                user_id: "u1".into(),
                status: PresenceStatus::Dnd,
            }],
        });
        assert_eq!(model.status("u1"), PresenceStatus::Dnd);
        assert_eq!(model.status("u2"), PresenceStatus::Offline);

        model.apply(&ServerEvent::StatusUpdate {
            user_id: "u1".into(),
            status: PresenceStatus::Away,
        });
        model.apply(&ServerEvent::StatusUpdate {
            user_id: "u1".into(),
            status: PresenceStatus::Online,
        });
        assert_eq!(model.status("u1"), PresenceStatus::Online);

        model.apply(&ServerEvent::UserOffline { user_id: "u1".into() });
        assert_eq!(model.status("u1"), PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_typing_removes_indicator() {
        let model = ReadModel::new(Duration::from_secs(5));
        let dm = Topic::dm("42");
        model.apply(&ServerEvent::Typing(typing("a")));
        tokio::time::advance(Duration::from_millis(10)).await;
        model.apply(&ServerEvent::Typing(typing("b")));
        assert_eq!(model.typing_in(&dm), vec!["a".to_string(), "b".to_string()]);

        model.apply(&ServerEvent::StopTyping(typing("a")));
        assert_eq!(model.typing_in(&dm), vec!["b".to_string()]);

        model.apply(&ServerEvent::UserOffline { user_id: "b".into() });
        assert!(model.typing_in(&dm).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_typing_expires_locally() {
        let model = ReadModel::new(Duration::from_secs(5));
        let dm = Topic::dm("42");
        model.apply(&ServerEvent::Typing(typing("a")));

        tokio::time::advance(Duration::from_secs(3)).await;
        model.apply(&ServerEvent::Typing(typing("b")));
        assert_eq!(model.typing_in(&dm).len(), 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(model.typing_in(&dm), vec!["b".to_string()]);
    }
}
