//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_common::protocol::{DecodeError, Handshake, CLOSE_AUTH_FAILED};
use parley_common::ClientEvent;
use tokio::time::{self, Instant};

use super::connection::{Connection, Outbound};
use super::hub::Gateway;
use crate::AppState;

/// Close codes (4000-range for application-level).
const CLOSE_MALFORMED_FRAME: u16 = 4000;
const CLOSE_UNKNOWN_EVENT: u16 = 4001;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let gateway = state.gateway.clone();

    // Step 1: the first frame must be the handshake.
    let handshake = match time::timeout(state.config.handshake_timeout, read_handshake(&mut ws_rx)).await
    {
        Ok(Some(handshake)) => handshake,
        Ok(None) => {
            tracing::debug!("connection closed before handshake");
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "handshake-timeout").await;
            return;
        }
    };

    // Step 2: authenticate. No retry: the client decides what to do next.
    let user = match gateway.authenticate(&handshake).await {
        Ok(user) => user,
        Err(reason) => {
            tracing::debug!(%reason, "handshake rejected");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, &reason.to_string()).await;
            return;
        }
    };

    // Step 3: register and run until either side hangs up.
    let (conn, outbound) = gateway.admit(user).await;
    run_session(
        &gateway,
        &conn,
        ws_tx,
        ws_rx,
        outbound,
        state.config.heartbeat_interval,
    )
    .await;
    gateway.close(&conn.connection_id).await;
}

/// Wait for the first data frame. A frame that is not a handshake object
/// yields an empty handshake, which authenticates as `no-token`.
async fn read_handshake(ws_rx: &mut WsStream) -> Option<Handshake> {
    while let Some(msg) = ws_rx.next().await {
        let parsed = match msg {
            Ok(Message::Text(text)) => serde_json::from_str(text.as_str()),
            Ok(Message::Binary(bytes)) => serde_json::from_slice(&bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                tracing::debug!(?e, "ws read error during handshake");
                return None;
            }
        };
        return Some(parsed.unwrap_or_default());
    }
    None
}

/// Main session loop: apply client events, flush the outbound queue,
/// enforce the heartbeat.
async fn run_session(
    gateway: &Gateway,
    conn: &Connection,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut outbound: Outbound,
    heartbeat: Duration,
) {
    let mut heartbeat_timer = time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut got_frame = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        got_frame = true;
                        match ClientEvent::decode(text.as_str()) {
                            Ok(event) => {
                                let name = event.name();
                                if let Err(err) = gateway.handle_event(conn, event) {
                                    tracing::warn!(
                                        connection_id = %conn.connection_id,
                                        event = name,
                                        %err,
                                        "client event rejected"
                                    );
                                }
                            }
                            Err(DecodeError::Malformed(err)) => {
                                tracing::debug!(connection_id = %conn.connection_id, %err, "malformed frame");
                                let _ = send_close(&mut ws_tx, CLOSE_MALFORMED_FRAME, "malformed-frame").await;
                                break;
                            }
                            Err(DecodeError::UnknownEvent(name)) => {
                                tracing::debug!(connection_id = %conn.connection_id, %name, "unknown event");
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_EVENT, "unknown-event").await;
                                break;
                            }
                            Err(err @ DecodeError::InvalidPayload { .. }) => {
                                tracing::warn!(connection_id = %conn.connection_id, %err, "dropping client event");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => got_frame = true,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %conn.connection_id, "ws read error");
                        break;
                    }
                }
            }

            event = outbound.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(event.as_ref()) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(connection_id = %conn.connection_id, ?err, "failed to encode event");
                    }
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_frame {
                    tracing::debug!(connection_id = %conn.connection_id, "heartbeat timeout, closing connection");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "heartbeat-timeout").await;
                    break;
                }
                got_frame = false;
                if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
