//! Connection gateway: admits authenticated connections, validates client
//! events and tears connections down.
//!
//! Transport-agnostic; `server.rs` drives it from a WebSocket.

use std::sync::Arc;

use parley_common::protocol::{
    Handshake, PresenceEntry, ReadyPayload, TopicParseError, TypingPayload,
};
use parley_common::{ClientEvent, PresenceStatus, ServerEvent, Topic};

use super::connection::{Connection, ConnectionTable, Delivery, Outbound};
use super::presence::PresenceBroadcaster;
use super::relay::TypingRelay;
use super::router::RoomRouter;
use crate::auth::tokens::{AuthError, AuthenticatedUser, TokenValidator};

/// Why a client event was refused. The connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum EventRejected {
    #[error(transparent)]
    InvalidTopic(#[from] TopicParseError),
    #[error("event claims user `{claimed}` on a connection owned by `{owner}`")]
    ForeignUser { claimed: String, owner: String },
    #[error("connection is not subscribed to {0}")]
    NotSubscribed(Topic),
}

pub struct Gateway {
    validator: Arc<dyn TokenValidator>,
    connections: Arc<ConnectionTable>,
    router: Arc<RoomRouter>,
    presence: Arc<PresenceBroadcaster>,
    relay: TypingRelay,
    queue_capacity: usize,
}

impl Gateway {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        connections: Arc<ConnectionTable>,
        router: Arc<RoomRouter>,
        presence: Arc<PresenceBroadcaster>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            validator,
            connections,
            relay: TypingRelay::new(router.clone()),
            router,
            presence,
            queue_capacity,
        }
    }

    /// Validate the handshake token. Missing and blank tokens never reach
    /// the validator.
    pub async fn authenticate(&self, handshake: &Handshake) -> Result<AuthenticatedUser, AuthError> {
        let token = handshake
            .auth_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(AuthError::NoToken)?;
        self.validator.validate(token).await
    }

    /// Register an authenticated connection.
    ///
    /// `ready` is queued before the connection becomes visible to broadcasts,
    /// so it is always the first frame the client receives.
    pub async fn admit(&self, user: AuthenticatedUser) -> (Arc<Connection>, Outbound) {
        let (conn, outbound) = Connection::new(user, self.queue_capacity);
        let conn = Arc::new(conn);

        let mut presences = self.presence.snapshot();
        if !presences.iter().any(|p| p.user_id == conn.user_id) {
            presences.push(PresenceEntry {
                user_id: conn.user_id.clone(),
                status: PresenceStatus::Online,
            });
        }
        conn.deliver(Arc::new(ServerEvent::Ready(ReadyPayload {
            user_id: conn.user_id.clone(),
            connection_id: conn.connection_id.clone(),
            presences,
        })));

        self.connections.insert(conn.clone());
        self.router.join(&conn.connection_id, [conn.personal_topic()]);
        self.presence.connect(&conn.user_id, &conn.connection_id).await;

        tracing::info!(
            connection_id = %conn.connection_id,
            user_id = %conn.user_id,
            "connection admitted"
        );
        (conn, outbound)
    }

    /// Send one event to one connection.
    pub fn send(&self, connection_id: &str, event: ServerEvent) -> bool {
        self.connections
            .get(connection_id)
            .map(|conn| conn.deliver(Arc::new(event)) == Delivery::Queued)
            .unwrap_or(false)
    }

    /// Send an event to every subscriber of a topic.
    pub fn broadcast(&self, topic: &Topic, event: ServerEvent) -> usize {
        self.router.broadcast_to_topic(topic, event)
    }

    /// Tear a connection down. Idempotent.
    ///
    /// Peers are told the user stopped typing in any topic left mid-typing.
    pub async fn close(&self, connection_id: &str) {
        let Some(conn) = self.connections.remove(connection_id) else {
            return;
        };

        for topic in conn.take_typing() {
            self.stopped_typing(&conn, &topic);
        }

        let topics = self.router.leave_all(connection_id);
        self.presence.disconnect(&conn.user_id, connection_id).await;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %conn.user_id,
            topics = topics.len(),
            "connection closed"
        );
    }

    /// Apply one client event on behalf of `conn`.
    pub fn handle_event(&self, conn: &Connection, event: ClientEvent) -> Result<(), EventRejected> {
        match event {
            ClientEvent::JoinRooms(rooms) => {
                let added = self.router.join(&conn.connection_id, rooms.topics()?);
                tracing::debug!(connection_id = %conn.connection_id, added, "joined rooms");
            }
            ClientEvent::LeaveRooms(rooms) => {
                let topics = rooms.topics()?;
                // Peers hear the stop before the room is left; afterwards the
                // client's own typing_stop would be refused.
                for topic in &topics {
                    if conn.set_typing(topic, false) {
                        self.stopped_typing(conn, topic);
                    }
                }
                let removed = self.router.leave(&conn.connection_id, topics);
                tracing::debug!(connection_id = %conn.connection_id, removed, "left rooms");
            }
            ClientEvent::TypingStart(payload) => {
                let topic = self.check_typing(conn, &payload)?;
                conn.set_typing(&topic, true);
                self.relay.typing_start(&topic, payload, &conn.connection_id);
            }
            ClientEvent::TypingStop(payload) => {
                let topic = self.check_typing(conn, &payload)?;
                conn.set_typing(&topic, false);
                self.relay.typing_stop(&topic, payload, &conn.connection_id);
            }
        }
        Ok(())
    }

    /// Tell `topic`'s other subscribers that `conn` stopped typing there.
    fn stopped_typing(&self, conn: &Connection, topic: &Topic) {
        if let Some(target) = topic.room_target() {
            let payload = TypingPayload {
                target,
                user_id: conn.user_id.clone(),
                username: conn.display_name.clone(),
            };
            self.relay.typing_stop(topic, payload, &conn.connection_id);
        }
    }

    fn check_typing(&self, conn: &Connection, payload: &TypingPayload) -> Result<Topic, EventRejected> {
        if payload.user_id != conn.user_id {
            return Err(EventRejected::ForeignUser {
                claimed: payload.user_id.clone(),
                owner: conn.user_id.clone(),
            });
        }
        let topic = payload.target.validated_topic()?;
        if !self.router.is_subscribed(&conn.connection_id, &topic) {
            return Err(EventRejected::NotSubscribed(topic));
        }
        Ok(topic)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
