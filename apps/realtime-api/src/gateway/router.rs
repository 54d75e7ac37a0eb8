//! Topic subscriptions and fan-out to subscribed connections.
//!
//! Two indexes are kept: topic → connection ids (for routing) and
//! connection id → topics (so a closing connection can be removed from every
//! topic it joined). They are updated one after the other, never while a
//! guard on the other map is held.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parley_common::{ServerEvent, Topic};

use super::connection::{ConnectionTable, Delivery};

pub struct RoomRouter {
    connections: Arc<ConnectionTable>,
    subscribers: DashMap<Topic, HashSet<String>>,
    joined: DashMap<String, HashSet<Topic>>,
}

impl RoomRouter {
    pub fn new(connections: Arc<ConnectionTable>) -> Self {
        Self {
            connections,
            subscribers: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    /// Subscribe a connection to each topic. Returns how many were new.
    pub fn join<I>(&self, connection_id: &str, topics: I) -> usize
    where
        I: IntoIterator<Item = Topic>,
    {
        let added: Vec<Topic> = {
            let mut mine = self.joined.entry(connection_id.to_string()).or_default();
            topics
                .into_iter()
                .filter(|topic| mine.insert(topic.clone()))
                .collect()
        };

        for topic in &added {
            self.subscribers
                .entry(topic.clone())
                .or_default()
                .insert(connection_id.to_string());
        }
        added.len()
    }

    /// Unsubscribe a connection from each topic. Absent topics are ignored.
    pub fn leave<I>(&self, connection_id: &str, topics: I) -> usize
    where
        I: IntoIterator<Item = Topic>,
    {
        let removed: Vec<Topic> = match self.joined.get_mut(connection_id) {
            Some(mut mine) => topics.into_iter().filter(|t| mine.remove(t)).collect(),
            None => return 0,
        };
        self.joined.remove_if(connection_id, |_, mine| mine.is_empty());

        for topic in &removed {
            self.drop_subscriber(topic, connection_id);
        }
        removed.len()
    }

    /// Remove a connection from every topic it joined.
    pub fn leave_all(&self, connection_id: &str) -> Vec<Topic> {
        let topics: Vec<Topic> = self
            .joined
            .remove(connection_id)
            .map(|(_, mine)| mine.into_iter().collect())
            .unwrap_or_default();

        for topic in &topics {
            self.drop_subscriber(topic, connection_id);
        }
        topics
    }

    fn drop_subscriber(&self, topic: &Topic, connection_id: &str) {
        if let Some(mut subs) = self.subscribers.get_mut(topic) {
            subs.remove(connection_id);
        }
        self.subscribers.remove_if(topic, |_, subs| subs.is_empty());
    }

    /// Deliver `event` to every subscriber of `topic` except `exclude`.
    /// Returns the number of connections the event was queued for.
    pub fn route(&self, topic: &Topic, event: ServerEvent, exclude: Option<&str>) -> usize {
        let targets: Vec<String> = match self.subscribers.get(topic) {
            Some(subs) => subs
                .iter()
                .filter(|id| Some(id.as_str()) != exclude)
                .cloned()
                .collect(),
            None => return 0,
        };

        let event = Arc::new(event);
        let delivered = targets
            .iter()
            .filter(|id| self.deliver_to(id, &event))
            .count();

        tracing::trace!(%topic, event = event.name(), delivered, "routed event");
        delivered
    }

    /// `route` without exclusion, for request handlers that push events.
    pub fn broadcast_to_topic(&self, topic: &Topic, event: ServerEvent) -> usize {
        self.route(topic, event, None)
    }

    /// Deliver to every live connection regardless of subscriptions.
    pub fn broadcast_all(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        self.connections
            .all()
            .iter()
            .filter(|conn| conn.deliver(event.clone()) == Delivery::Queued)
            .count()
    }

    fn deliver_to(&self, connection_id: &str, event: &Arc<ServerEvent>) -> bool {
        // Missing or closed connections are dead subscriptions; they are
        // cleaned up when the disconnect is processed.
        match self.connections.get(connection_id) {
            Some(conn) => conn.deliver(event.clone()) == Delivery::Queued,
            None => false,
        }
    }

    pub fn subscribers(&self, topic: &Topic) -> HashSet<String> {
        self.subscribers
            .get(topic)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, connection_id: &str) -> HashSet<Topic> {
        self.joined
            .get(connection_id)
            .map(|t| t.value().clone())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, connection_id: &str, topic: &Topic) -> bool {
        self.joined
            .get(connection_id)
            .map(|t| t.contains(topic))
            .unwrap_or(false)
    }

    pub fn topic_count(&self) -> usize {
        self.subscribers.len()
    }
}
