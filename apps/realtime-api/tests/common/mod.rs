#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realtime_api::auth::tokens::KvTokenValidator;
use realtime_api::config::Config;
use realtime_api::db::kv::{KeyValueStore, MemoryStore};
use realtime_api::db::status::KvStatusStore;
use realtime_api::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `(token, user_id, display_name)` seeded into every test state.
pub const USERS: [(&str, &str, &str); 3] = [
    ("tok_alice", "u_alice", "Alice"),
    ("tok_bob", "u_bob", "Bob"),
    ("tok_carol", "u_carol", "Carol"),
];

/// Token whose user has no profile.
pub const GHOST_TOKEN: &str = "tok_ghost";

pub const ALICE: &str = "tok_alice";
pub const BOB: &str = "tok_bob";
pub const CAROL: &str = "tok_carol";

/// Build a test AppState with in-memory stores and the seeded users.
pub async fn test_state() -> AppState {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let validator = KvTokenValidator::new(kv.clone());
    for (token, user_id, display_name) in USERS {
        validator.register_user(user_id, display_name).await.unwrap();
        validator.register_token(token, user_id).await.unwrap();
    }
    validator.register_token(GHOST_TOKEN, "u_ghost").await.unwrap();

    let config = Config {
        handshake_timeout: Duration::from_millis(500),
        ..Config::default()
    };
    AppState::build(
        config,
        Arc::new(validator),
        Arc::new(KvStatusStore::new(kv)),
    )
}

pub async fn test_app() -> (Router, AppState) {
    let state = test_state().await;
    let app = realtime_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background.
pub async fn start_ws_server() -> (SocketAddr, AppState) {
    let (app, state) = test_app().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// Open a gateway connection and send `frame` as the handshake.
pub async fn open_with(addr: SocketAddr, frame: &str) -> Ws {
    let url = format!("ws://{addr}/gateway");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send handshake");
    ws
}

/// Connect with a token and consume the `ready` event.
pub async fn connect(addr: SocketAddr, token: &str) -> (Ws, serde_json::Value) {
    let handshake = serde_json::json!({ "auth_token": token }).to_string();
    let mut ws = open_with(addr, &handshake).await;
    let ready = next_event(&mut ws).await;
    assert_eq!(ready["t"], "ready", "first frame must be ready: {ready}");
    (ws, ready["d"].clone())
}

pub async fn send_event(ws: &mut Ws, event: serde_json::Value) {
    ws.send(Message::Text(event.to_string().into()))
        .await
        .expect("send event");
}

/// Next data frame as JSON, skipping control frames. Panics on close or
/// after 5 seconds.
pub async fn next_event(ws: &mut Ws) -> serde_json::Value {
    time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("parse event");
                }
                Some(Ok(Message::Close(frame))) => panic!("connection closed: {frame:?}"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("ws read error: {e}"),
                None => panic!("stream ended"),
            }
        }
    })
    .await
    .expect("timeout waiting for event")
}

/// Skip events until one named `name` arrives.
pub async fn next_event_named(ws: &mut Ws, name: &str) -> serde_json::Value {
    loop {
        let event = next_event(ws).await;
        if event["t"] == name {
            return event;
        }
    }
}

/// Read for `window` and return every event seen.
pub async fn events_within(ws: &mut Ws, window: Duration) -> Vec<serde_json::Value> {
    let mut seen = Vec::new();
    let _ = time::timeout(window, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                seen.push(serde_json::from_str(text.as_str()).expect("parse event"));
            }
        }
    })
    .await;
    seen
}

/// Wait for the server to close the connection; returns `(code, reason)`.
pub async fn expect_close(ws: &mut Ws) -> (u16, String) {
    time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    return (u16::from(frame.code), frame.reason.as_str().to_string());
                }
                Some(Ok(Message::Close(None))) => panic!("close frame without code"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("ws read error before close: {e}"),
                None => panic!("stream ended without close frame"),
            }
        }
    })
    .await
    .expect("timeout waiting for close")
}

/// Poll until `check` holds. Used to sync on server-side state that has no
/// acknowledgement on the wire.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(5), async {
        while !check() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
