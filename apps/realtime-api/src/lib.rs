pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use auth::tokens::TokenValidator;
use config::Config;
use db::status::StatusStore;
use gateway::connection::ConnectionTable;
use gateway::hub::Gateway;
use gateway::presence::PresenceBroadcaster;
use gateway::registry::SessionRegistry;
use gateway::router::RoomRouter;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub validator: Arc<dyn TokenValidator>,
    pub status_store: Arc<dyn StatusStore>,
    pub gateway: Arc<Gateway>,
    pub presence: Arc<PresenceBroadcaster>,
    pub router: Arc<RoomRouter>,
}

impl AppState {
    /// Wire the gateway components around the given collaborators. The
    /// session registry and connection table are created here, once per
    /// process.
    pub fn build(
        config: Config,
        validator: Arc<dyn TokenValidator>,
        status_store: Arc<dyn StatusStore>,
    ) -> Self {
        let connections = Arc::new(ConnectionTable::new());
        let router = Arc::new(RoomRouter::new(connections.clone()));
        let presence = Arc::new(PresenceBroadcaster::new(
            Arc::new(SessionRegistry::new()),
            router.clone(),
            status_store.clone(),
        ));
        let gateway = Arc::new(Gateway::new(
            validator.clone(),
            connections,
            router.clone(),
            presence.clone(),
            config.outbound_queue_capacity,
        ));

        Self {
            config: Arc::new(config),
            validator,
            status_store,
            gateway,
            presence,
            router,
        }
    }
}
