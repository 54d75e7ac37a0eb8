//! Outgoing typing indicators for the local user.
//!
//! The first keystroke in a room sends `typing_start`; further keystrokes only
//! push the idle deadline back, re-sending `typing_start` once per idle window
//! so peers' expiry never fires while the user is still typing. When the
//! deadline passes a `typing_stop` goes out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_common::protocol::TypingPayload;
use parley_common::{ClientEvent, RoomTarget, Topic};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::manager::ConnectionManager;

/// Where typing events are sent. Returns `false` when the event was dropped.
pub trait EventSink: Send + Sync + 'static {
    fn send_event(&self, event: ClientEvent) -> bool;
}

impl EventSink for ConnectionManager {
    fn send_event(&self, event: ClientEvent) -> bool {
        self.send(event).is_ok()
    }
}

pub struct TypingTracker {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Arc<dyn EventSink>,
    user_id: String,
    username: String,
    idle: Duration,
    active: Mutex<HashMap<Topic, Active>>,
    generation: Mutex<u64>,
}

struct Active {
    target: RoomTarget,
    generation: u64,
    last_start: Instant,
    timer: JoinHandle<()>,
}

impl TypingTracker {
    pub fn new(
        sink: Arc<dyn EventSink>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        idle: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                user_id: user_id.into(),
                username: username.into(),
                idle,
                active: Mutex::new(HashMap::new()),
                generation: Mutex::new(0),
            }),
        }
    }

    /// Record local input in `target`.
    pub fn keystroke(&self, target: RoomTarget) {
        let inner = &self.inner;
        let topic = target.topic();
        let now = Instant::now();
        let generation = inner.next_generation();
        let timer = inner.clone().spawn_idle_timer(topic.clone(), generation);

        let mut active = inner.active.lock();
        let last_start = match active.remove(&topic) {
            Some(prev) => {
                prev.timer.abort();
                if now.duration_since(prev.last_start) >= inner.idle {
                    inner.send(ClientEvent::TypingStart(inner.payload(&target)));
                    now
                } else {
                    prev.last_start
                }
            }
            None => {
                inner.send(ClientEvent::TypingStart(inner.payload(&target)));
                now
            }
        };
        active.insert(
            topic,
            Active {
                target,
                generation,
                last_start,
                timer,
            },
        );
    }

    /// Stop typing in `target` now (message sent, input cleared).
    pub fn stop(&self, target: &RoomTarget) {
        let removed = self.inner.active.lock().remove(&target.topic());
        if let Some(active) = removed {
            active.timer.abort();
            self.inner
                .send(ClientEvent::TypingStop(self.inner.payload(&active.target)));
        }
    }

    /// Stop everywhere, e.g. before logging out.
    pub fn stop_all(&self) {
        let drained: Vec<Active> = self.inner.active.lock().drain().map(|(_, a)| a).collect();
        for active in drained {
            active.timer.abort();
            self.inner
                .send(ClientEvent::TypingStop(self.inner.payload(&active.target)));
        }
    }

    pub fn is_typing(&self, target: &RoomTarget) -> bool {
        self.inner.active.lock().contains_key(&target.topic())
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        for (_, active) in self.inner.active.lock().drain() {
            active.timer.abort();
        }
    }
}

impl Inner {
    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        *generation
    }

    fn payload(&self, target: &RoomTarget) -> TypingPayload {
        TypingPayload {
            target: target.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
        }
    }

    fn send(&self, event: ClientEvent) {
        if !self.sink.send_event(event) {
            tracing::debug!("typing event dropped, not connected");
        }
    }

    fn spawn_idle_timer(self: Arc<Self>, topic: Topic, generation: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            time::sleep(self.idle).await;
            let expired = {
                let mut active = self.active.lock();
                match active.get(&topic) {
                    Some(a) if a.generation == generation => active.remove(&topic),
                    _ => None,
                }
            };
            if let Some(active) = expired {
                self.send(ClientEvent::TypingStop(self.payload(&active.target)));
            }
        })
    }
}
