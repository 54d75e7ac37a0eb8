//! Client-side connection lifecycle.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ready──▶ Connected
//!                              │                     │
//!                        failure/timeout        transport close
//!                              ▼                     ▼
//!                         Degraded(err)         Disconnected
//! ```
//!
//! At most one attempt is in flight per manager. The attempt is a shared
//! future kept in a slot; concurrent callers await the same one instead of
//! opening another transport. Degraded is left by `retry()`, a token change,
//! or `ensure_connected()` while the automatic retry cap is not reached.
//!
//! Spawned tasks hold the manager weakly: dropping the last handle aborts
//! them and closes the session.

use std::sync::{Arc, Weak};

use futures_util::future::{self, AbortHandle, BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use parley_common::{ClientEvent, ServerEvent};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ClientConfig;
use crate::error::ConnectError;
use crate::read_model::ReadModel;
use crate::transport::{Connector, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { connection_id: String },
    Degraded(ConnectError),
}

type Attempt = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ServerEvent>,
    read_model: ReadModel,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    token: Option<String>,
    /// Consecutive failed attempts with the current token.
    failures: u32,
    generation: u64,
    pending: Option<Pending>,
    session: Option<ActiveSession>,
    debounce: Option<JoinHandle<()>>,
}

struct Pending {
    generation: u64,
    attempt: Attempt,
    abort: AbortHandle,
}

struct ActiveSession {
    generation: u64,
    commands: mpsc::Sender<ClientEvent>,
    reader: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                read_model: ReadModel::new(config.remote_typing_expiry),
                config,
                connector,
                state,
                events,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Every server event received after the subscription, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn read_model(&self) -> &ReadModel {
        &self.inner.read_model
    }

    pub fn failed_attempts(&self) -> u32 {
        self.inner.slot.lock().failures
    }

    pub fn token(&self) -> Option<String> {
        self.inner.slot.lock().token.clone()
    }

    /// Change the identity this client connects as.
    ///
    /// Changes are debounced: only the last token set within the debounce
    /// window triggers a reconnect. `None` logs out and disconnects.
    pub fn set_token(&self, token: Option<String>) {
        let mut slot = self.inner.slot.lock();
        if slot.token == token {
            return;
        }
        slot.token = token.clone();
        slot.failures = 0;
        if let Some(timer) = slot.debounce.take() {
            timer.abort();
        }

        let debounce = self.inner.config.debounce;
        let weak = Arc::downgrade(&self.inner);
        slot.debounce = Some(tokio::spawn(async move {
            time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.teardown();
            if token.is_some() {
                // The attempt runs on its own task; its outcome lands in `state`.
                if let Err(err) = inner.attempt(false) {
                    tracing::debug!(%err, "connect after token change failed");
                }
            }
        }));
    }

    /// Connect unless already connected, joining any attempt in flight.
    ///
    /// Counts against the retry cap: once `max_attempts` consecutive attempts
    /// have failed this returns `RetryLimitReached` without trying.
    pub async fn ensure_connected(&self) -> Result<(), ConnectError> {
        match self.inner.attempt(false)? {
            Some(attempt) => attempt.await,
            None => Ok(()),
        }
    }

    /// Explicit user-initiated retry. Bypasses the retry cap.
    pub async fn retry(&self) -> Result<(), ConnectError> {
        match self.inner.attempt(true)? {
            Some(attempt) => attempt.await,
            None => Ok(()),
        }
    }

    /// Queue a client event on the live session.
    pub fn send(&self, event: ClientEvent) -> Result<(), ConnectError> {
        let slot = self.inner.slot.lock();
        let session = slot.session.as_ref().ok_or(ConnectError::NotConnected)?;
        session.commands.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                ConnectError::Transport("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ConnectError::NotConnected,
        })
    }

    /// Close the session and cancel any attempt in flight.
    pub fn disconnect(&self) {
        self.inner.teardown();
    }

    /// Release everything: pending timers, the attempt and the session.
    pub fn shutdown(&self) {
        if let Some(timer) = self.inner.slot.lock().debounce.take() {
            timer.abort();
        }
        self.inner.teardown();
    }
}

impl Inner {
    /// The attempt to await, or `None` when already connected.
    fn attempt(self: &Arc<Self>, manual: bool) -> Result<Option<Attempt>, ConnectError> {
        let mut slot = self.slot.lock();
        if slot.session.is_some() {
            return Ok(None);
        }
        if let Some(pending) = &slot.pending {
            return Ok(Some(pending.attempt.clone()));
        }
        if !manual && slot.failures >= self.config.max_attempts {
            return Err(ConnectError::RetryLimitReached);
        }
        self.start_attempt(&mut slot).map(Some)
    }

    fn start_attempt(self: &Arc<Self>, slot: &mut Slot) -> Result<Attempt, ConnectError> {
        let token = slot.token.clone().ok_or(ConnectError::NoToken)?;
        slot.generation += 1;
        let generation = slot.generation;

        let connector = self.connector.clone();
        let (handshake, abort) =
            future::abortable(async move { connector.connect(&token).await });

        let weak = Arc::downgrade(self);
        let attempt = async move {
            let outcome = handshake.await.unwrap_or(Err(ConnectError::Cancelled));
            match weak.upgrade() {
                Some(inner) => inner.finish_attempt(generation, outcome),
                None => Err(ConnectError::Cancelled),
            }
        }
        .boxed()
        .shared();

        slot.pending = Some(Pending {
            generation,
            attempt: attempt.clone(),
            abort,
        });
        self.state.send_replace(ConnectionState::Connecting);
        tracing::debug!(generation, attempt = slot.failures + 1, "connecting");

        // Runs to completion even if every caller stops waiting.
        tokio::spawn(attempt.clone());
        Ok(attempt)
    }

    fn finish_attempt(
        self: &Arc<Self>,
        generation: u64,
        outcome: Result<Session, ConnectError>,
    ) -> Result<(), ConnectError> {
        let mut slot = self.slot.lock();
        if slot.pending.as_ref().map(|p| p.generation) != Some(generation) {
            // Superseded by a teardown; a late session is dropped here.
            return Err(ConnectError::Cancelled);
        }
        slot.pending = None;

        match outcome {
            Ok(session) => {
                slot.failures = 0;
                let Session {
                    ready,
                    events,
                    commands,
                } = session;
                self.read_model.seed(&ready);
                let reader = self.spawn_reader(generation, events);
                slot.session = Some(ActiveSession {
                    generation,
                    commands,
                    reader,
                });
                tracing::info!(
                    user_id = %ready.user_id,
                    connection_id = %ready.connection_id,
                    "connected"
                );
                let connection_id = ready.connection_id.clone();
                let _ = self.events.send(ServerEvent::Ready(ready));
                self.state
                    .send_replace(ConnectionState::Connected { connection_id });
                Ok(())
            }
            Err(err) => {
                slot.failures += 1;
                tracing::warn!(%err, failures = slot.failures, "connection attempt failed");
                self.state.send_replace(ConnectionState::Degraded(err.clone()));
                Err(err)
            }
        }
    }

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<ServerEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.read_model.apply(&event);
                let _ = inner.events.send(event);
            }
            if let Some(inner) = weak.upgrade() {
                inner.session_closed(generation);
            }
        })
    }

    /// The transport went away on its own.
    fn session_closed(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.session.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        slot.session = None;
        self.read_model.clear();
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("disconnected");
    }

    fn teardown(&self) {
        let mut slot = self.slot.lock();
        if let Some(pending) = slot.pending.take() {
            pending.abort.abort();
        }
        if let Some(session) = slot.session.take() {
            // Dropping `commands` makes the transport send a close frame.
            session.reader.abort();
        }
        self.read_model.clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if let Some(timer) = slot.debounce.take() {
            timer.abort();
        }
        if let Some(pending) = slot.pending.take() {
            pending.abort.abort();
        }
        if let Some(session) = slot.session.take() {
            session.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use parley_common::protocol::{PresenceEntry, ReadyPayload};
    use parley_common::PresenceStatus;

    use super::*;

    /// Server-side ends of a scripted session.
    struct Remote {
        events: mpsc::Sender<ServerEvent>,
        commands: mpsc::Receiver<ClientEvent>,
    }

    /// Connector that replays scripted outcomes; an exhausted script succeeds.
    #[derive(Default)]
    struct ScriptedConnector {
        script: Mutex<VecDeque<ConnectError>>,
        delay: Duration,
        tokens: Mutex<Vec<String>>,
        remotes: Mutex<Vec<Remote>>,
    }

    impl ScriptedConnector {
        fn failing(times: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(
                    std::iter::repeat(ConnectError::Rejected("invalid-token".into()))
                        .take(times)
                        .collect(),
                ),
                delay,
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.tokens.lock().len()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, token: &str) -> Result<Session, ConnectError> {
            self.tokens.lock().push(token.to_string());
            time::sleep(self.delay).await;
            if let Some(err) = self.script.lock().pop_front() {
                return Err(err);
            }

            let (events_tx, events) = mpsc::channel(16);
            let (commands, commands_rx) = mpsc::channel(16);
            self.remotes.lock().push(Remote {
                events: events_tx,
                commands: commands_rx,
            });
            Ok(Session {
                ready: ReadyPayload {
                    user_id: "u1".into(),
                    connection_id: format!("conn_{}", self.calls()),
                    presences: vec![PresenceEntry {
                        user_id: "u2".into(),
                        status: PresenceStatus::Dnd,
                    }],
                },
                events,
                commands,
            })
        }
    }

    fn manager(connector: Arc<ScriptedConnector>) -> ConnectionManager {
        ConnectionManager::new(ClientConfig::default(), connector)
    }

    /// Set the token and let the debounce window elapse.
    async fn settle(m: &ConnectionManager, token: &str) {
        m.set_token(Some(token.to_string()));
        time::sleep(ClientConfig::default().debounce + Duration::from_millis(50)).await;
        let mut state = m.watch_state();
        state
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected { .. } | ConnectionState::Degraded(_)
                )
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_attempt() {
        let connector = Arc::new(ScriptedConnector {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let m = manager(connector.clone());
        {
            m.inner.slot.lock().token = Some("tok".into());
        }

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let m = m.clone();
                tokio::spawn(async move { m.ensure_connected().await })
            })
            .collect();
        for caller in callers {
            assert_eq!(caller.await.unwrap(), Ok(()));
        }

        assert_eq!(connector.calls(), 1);
        assert_eq!(
            m.state(),
            ConnectionState::Connected {
                connection_id: "conn_1".into()
            }
        );
        assert_eq!(m.read_model().status("u2"), PresenceStatus::Dnd);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cap_halts_automatic_attempts_until_manual_retry() {
        let connector = ScriptedConnector::failing(3, Duration::from_millis(10));
        let m = manager(connector.clone());

        settle(&m, "tok").await;
        assert_eq!(
            m.state(),
            ConnectionState::Degraded(ConnectError::Rejected("invalid-token".into()))
        );
        assert!(m.ensure_connected().await.is_err());
        assert!(m.ensure_connected().await.is_err());
        assert_eq!(m.failed_attempts(), 3);

        assert_eq!(m.ensure_connected().await, Err(ConnectError::RetryLimitReached));
        assert_eq!(connector.calls(), 3);

        assert_eq!(m.retry().await, Ok(()));
        assert_eq!(connector.calls(), 4);
        assert_eq!(m.failed_attempts(), 0);
        assert!(matches!(m.state(), ConnectionState::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn token_changes_are_debounced() {
        let connector = Arc::new(ScriptedConnector::default());
        let m = manager(connector.clone());

        m.set_token(Some("a".into()));
        time::sleep(Duration::from_millis(40)).await;
        m.set_token(Some("b".into()));
        time::sleep(Duration::from_millis(40)).await;
        m.set_token(Some("c".into()));

        let mut state = m.watch_state();
        state
            .wait_for(|s| matches!(s, ConnectionState::Connected { .. }))
            .await
            .unwrap();
        assert_eq!(*connector.tokens.lock(), vec!["c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_token_clears_the_retry_cap() {
        let connector = ScriptedConnector::failing(3, Duration::ZERO);
        let m = manager(connector.clone());
        settle(&m, "old").await;
        let _ = m.ensure_connected().await;
        let _ = m.ensure_connected().await;
        assert_eq!(m.ensure_connected().await, Err(ConnectError::RetryLimitReached));

        settle(&m, "new").await;
        assert!(matches!(m.state(), ConnectionState::Connected { .. }));
        assert_eq!(connector.tokens.lock().last().map(String::as_str), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn events_feed_read_model_and_subscribers() {
        let connector = Arc::new(ScriptedConnector::default());
        let m = manager(connector.clone());
        let mut events = m.subscribe();
        settle(&m, "tok").await;
        assert!(matches!(events.recv().await.unwrap(), ServerEvent::Ready(_)));

        let update = ServerEvent::StatusUpdate {
            user_id: "u2".into(),
            status: PresenceStatus::Away,
        };
        let remote_events = connector.remotes.lock()[0].events.clone();
        remote_events.send(update.clone()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), update);
        assert_eq!(m.read_model().status("u2"), PresenceStatus::Away);

        let join = ClientEvent::JoinRooms(Default::default());
        m.send(join.clone()).unwrap();
        let sent = connector.remotes.lock()[0].commands.try_recv().unwrap();
        assert_eq!(sent, join);

        // Server hangs up: Connected → Disconnected, no reconnect.
        drop(remote_events);
        connector.remotes.lock().clear();
        let mut state = m.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(m.send(join), Err(ConnectError::NotConnected));
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_cancels_pending_attempt() {
        let connector = Arc::new(ScriptedConnector {
            delay: Duration::from_secs(60),
            ..Default::default()
        });
        let m = manager(connector.clone());
        {
            m.inner.slot.lock().token = Some("tok".into());
        }
        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.ensure_connected().await })
        };
        let mut state = m.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();

        m.set_token(None);
        assert_eq!(waiter.await.unwrap(), Err(ConnectError::Cancelled));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.failed_attempts(), 0);
        m.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_manager_closes_the_session() {
        let connector = Arc::new(ScriptedConnector::default());
        let m = manager(connector.clone());
        settle(&m, "tok").await;
        let other = m.clone();

        let Remote {
            events: _events,
            mut commands,
        } = connector.remotes.lock().remove(0);
        drop(m);
        assert!(commands.try_recv().is_err());
        drop(other);

        let closed = time::timeout(Duration::from_secs(1), commands.recv()).await;
        assert_eq!(closed, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_manager_cancels_the_debounced_connect() {
        let connector = Arc::new(ScriptedConnector::default());
        let m = manager(connector.clone());
        m.set_token(Some("tok".into()));
        drop(m);

        time::sleep(ClientConfig::default().debounce * 4).await;
        assert_eq!(connector.calls(), 0);
    }
}
