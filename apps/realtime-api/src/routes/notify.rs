//! Push endpoint for the messaging service: fans a persisted message out to
//! the conversation's subscribers.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parley_common::protocol::NewMessagePayload;
use parley_common::{RoomTarget, ServerEvent};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/notify/messages", post(notify_new_message))
}

/// Exactly one of `channel_id` or `dm_id` must be set.
#[derive(Debug, Deserialize, ToSchema)]
pub struct NotifyMessageRequest {
    pub channel_id: Option<String>,
    pub dm_id: Option<String>,
    /// Message body as stored by the messaging service. Relayed verbatim.
    #[schema(value_type = Object)]
    pub message: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NotifyResponse {
    /// Number of connections the event was queued for.
    pub delivered: usize,
}

/// Route a `new_message` event.
#[utoipa::path(
    post,
    path = "/api/v1/notify/messages",
    tag = "Notify",
    security(("bearer" = [])),
    request_body = NotifyMessageRequest,
    responses(
        (status = 200, description = "Event routed", body = NotifyResponse),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn notify_new_message(
    State(state): State<AppState>,
    caller: AuthUser,
    Json(body): Json<NotifyMessageRequest>,
) -> Result<Json<NotifyResponse>, ApiError> {
    let target = match (body.channel_id, body.dm_id) {
        (Some(id), None) => RoomTarget::Channel(id),
        (None, Some(id)) => RoomTarget::Dm(id),
        _ => {
            return Err(ApiError::bad_request(
                "Exactly one of channel_id or dm_id is required",
            ))
        }
    };
    let topic = target
        .validated_topic()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let delivered = state.router.broadcast_to_topic(
        &topic,
        ServerEvent::NewMessage(NewMessagePayload {
            target,
            message: body.message,
        }),
    );

    tracing::debug!(%topic, delivered, caller = %caller.user_id, "new_message routed");
    Ok(Json(NotifyResponse { delivered }))
}
