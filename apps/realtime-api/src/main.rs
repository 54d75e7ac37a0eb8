use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_api::auth::tokens::KvTokenValidator;
use realtime_api::config::Config;
use realtime_api::db::kv::{KeyValueStore, MemoryStore};
use realtime_api::db::status::KvStatusStore;
use realtime_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // In-memory KV store. Tokens and persisted presence live here until a
    // shared store is wired in.
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let validator = KvTokenValidator::new(kv.clone());
    for dev in &config.dev_tokens {
        let seeded = async {
            validator.register_user(&dev.user_id, &dev.display_name).await?;
            validator.register_token(&dev.token, &dev.user_id).await
        };
        if let Err(err) = seeded.await {
            tracing::warn!(user_id = %dev.user_id, ?err, "failed to seed dev token");
        }
    }

    tracing::info!(
        dev_tokens = config.dev_tokens.len(),
        handshake_timeout = ?config.handshake_timeout,
        heartbeat_interval = ?config.heartbeat_interval,
        "realtime-api configured"
    );

    let state = AppState::build(
        config,
        Arc::new(validator),
        Arc::new(KvStatusStore::new(kv)),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(realtime_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "realtime-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
