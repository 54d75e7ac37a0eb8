//! Typing indicators: routed straight through, nothing kept.

use std::sync::Arc;

use parley_common::protocol::TypingPayload;
use parley_common::{ServerEvent, Topic};

use super::router::RoomRouter;

pub struct TypingRelay {
    router: Arc<RoomRouter>,
}

impl TypingRelay {
    pub fn new(router: Arc<RoomRouter>) -> Self {
        Self { router }
    }

    /// Relay `user_typing` to the topic, skipping the sender's connection.
    pub fn typing_start(&self, topic: &Topic, payload: TypingPayload, sender: &str) -> usize {
        self.router
            .route(topic, ServerEvent::Typing(payload), Some(sender))
    }

    /// Relay `user_stop_typing` to the topic, skipping the sender's connection.
    pub fn typing_stop(&self, topic: &Topic, payload: TypingPayload, sender: &str) -> usize {
        self.router
            .route(topic, ServerEvent::StopTyping(payload), Some(sender))
    }
}
