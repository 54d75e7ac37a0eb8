mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use parley_common::protocol::RoomSet;
use parley_common::{ClientEvent, ServerEvent};
use realtime_api::auth::tokens::AuthenticatedUser;
use serde_json::json;

fn alice() -> AuthenticatedUser {
    AuthenticatedUser {
        user_id: "u_alice".into(),
        display_name: "Alice".into(),
    }
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();
    resp.assert_json(&json!({ "status": "ok" }));
}

// ---------------------------------------------------------------------------
// GET /api/v1/users/{user_id}/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_user_is_offline() {
    let (app, _state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/api/v1/users/u_nobody/status").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["user_id"], "u_nobody");
    assert_eq!(body["status"], "offline");
    assert!(body["updated_at"].is_null());
}

#[tokio::test]
async fn connected_user_is_online_with_timestamp() {
    let (app, state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();
    let (_conn, _rx) = state.gateway.admit(alice()).await;

    let body: serde_json::Value = server.get("/api/v1/users/u_alice/status").await.json();
    assert_eq!(body["status"], "online");
    assert!(body["updated_at"].is_string());
}

// ---------------------------------------------------------------------------
// PUT /api/v1/users/@me/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn set_status_requires_bearer_token() {
    let (app, _state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();

    server
        .put("/api/v1/users/@me/status")
        .json(&json!({ "status": "away" }))
        .await
        .assert_status_unauthorized();

    server
        .put("/api/v1/users/@me/status")
        .authorization_bearer("tok_bogus")
        .json(&json!({ "status": "away" }))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn set_status_without_connection_conflicts() {
    let (app, _state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();

    let resp = server
        .put("/api/v1/users/@me/status")
        .authorization_bearer(common::ALICE)
        .json(&json!({ "status": "dnd" }))
        .await;
    resp.assert_status(StatusCode::CONFLICT);

    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn set_status_overrides_and_broadcasts() {
    let (app, state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();
    let (_conn, mut rx) = state.gateway.admit(alice()).await;
    while rx.try_recv().is_ok() {}

    let resp = server
        .put("/api/v1/users/@me/status")
        .authorization_bearer(common::ALICE)
        .json(&json!({ "status": "away" }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "away");

    assert_eq!(
        *rx.try_recv().unwrap(),
        ServerEvent::StatusUpdate {
            user_id: "u_alice".into(),
            status: parley_common::PresenceStatus::Away,
        }
    );

    let body: serde_json::Value = server.get("/api/v1/users/u_alice/status").await.json();
    assert_eq!(body["status"], "away");
}

#[tokio::test]
async fn set_status_rejects_offline_and_unknown() {
    let (app, state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();
    let (_conn, _rx) = state.gateway.admit(alice()).await;

    for status in ["offline", "sleeping"] {
        server
            .put("/api/v1/users/@me/status")
            .authorization_bearer(common::ALICE)
            .json(&json!({ "status": status }))
            .await
            .assert_status_bad_request();
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/notify/messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_message_reaches_subscribers() {
    let (app, state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();
    let (conn, mut rx) = state.gateway.admit(alice()).await;
    state
        .gateway
        .handle_event(
            &conn,
            ClientEvent::JoinRooms(RoomSet {
                channels: vec!["general".into()],
                dms: vec![],
            }),
        )
        .unwrap();
    while rx.try_recv().is_ok() {}

    let message = json!({ "id": "m1", "content": "hello" });
    let resp = server
        .post("/api/v1/notify/messages")
        .authorization_bearer(common::BOB)
        .json(&json!({ "channel_id": "general", "message": message }))
        .await;
    resp.assert_status_ok();
    resp.assert_json(&json!({ "delivered": 1 }));

    let event = rx.try_recv().unwrap();
    assert_eq!(
        serde_json::to_value(&*event).unwrap(),
        json!({ "t": "new_message", "d": { "channel_id": "general", "message": message } })
    );
}

#[tokio::test]
async fn new_message_needs_exactly_one_target() {
    let (app, _state) = common::test_app().await;
    let server = TestServer::new(app).unwrap();

    let bodies = [
        json!({ "message": {} }),
        json!({ "channel_id": "c1", "dm_id": "d1", "message": {} }),
        json!({ "dm_id": "bad id", "message": {} }),
    ];
    for body in bodies {
        server
            .post("/api/v1/notify/messages")
            .authorization_bearer(common::BOB)
            .json(&body)
            .await
            .assert_status_bad_request();
    }

    let resp = server
        .post("/api/v1/notify/messages")
        .authorization_bearer(common::BOB)
        .json(&json!({ "dm_id": "nobody-here", "message": {} }))
        .await;
    resp.assert_json(&json!({ "delivered": 0 }));
}
