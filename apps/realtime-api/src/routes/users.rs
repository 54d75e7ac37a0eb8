//! Presence status endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parley_common::protocol::{validate_id, UnknownStatus};
use parley_common::PresenceStatus;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::presence::{PresenceError, PresenceQuery};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/@me/status", put(update_my_status))
        .route("/users/{user_id}/status", get(get_user_status))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserStatusResponse {
    pub user_id: String,
    #[schema(value_type = String, example = "online")]
    pub status: PresenceStatus,
    /// When the status was last persisted. Absent for users never seen.
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    /// One of `online`, `away`, `dnd`.
    pub status: String,
}

// ---------------------------------------------------------------------------
// GET /api/v1/users/{user_id}/status
// ---------------------------------------------------------------------------

/// Current presence of a user.
#[utoipa::path(
    get,
    path = "/api/v1/users/{user_id}/status",
    tag = "Presence",
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Current status", body = UserStatusResponse),
        (status = 400, description = "Invalid user id", body = ApiErrorBody),
    ),
)]
pub async fn get_user_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserStatusResponse>, ApiError> {
    validate_id(&user_id).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let status = state.presence.current_status(&user_id).await;
    let updated_at = state
        .status_store
        .get_status(&user_id)
        .await?
        .map(|stored| stored.updated_at);

    Ok(Json(UserStatusResponse {
        user_id,
        status,
        updated_at,
    }))
}

// ---------------------------------------------------------------------------
// PUT /api/v1/users/@me/status
// ---------------------------------------------------------------------------

/// Set an explicit status override.
#[utoipa::path(
    put,
    path = "/api/v1/users/@me/status",
    tag = "Presence",
    security(("bearer" = [])),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status applied", body = UserStatusResponse),
        (status = 400, description = "Unknown or unsettable status", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 409, description = "Caller has no live connection", body = ApiErrorBody),
    ),
)]
pub async fn update_my_status(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<UserStatusResponse>, ApiError> {
    let status: PresenceStatus = body
        .status
        .parse()
        .map_err(|e: UnknownStatus| ApiError::bad_request(e.to_string()))?;

    match state.presence.set_status(&user.user_id, status).await {
        Ok(previous) => {
            if let Some(previous) = previous {
                tracing::info!(user_id = %user.user_id, %previous, %status, "status override applied");
            }
        }
        Err(err @ PresenceError::NotConnected) => return Err(ApiError::conflict(err.to_string())),
        Err(err @ PresenceError::NotSettable(_)) => return Err(ApiError::bad_request(err.to_string())),
    }

    let updated_at = state
        .status_store
        .get_status(&user.user_id)
        .await?
        .map(|stored| stored.updated_at);

    Ok(Json(UserStatusResponse {
        user_id: user.user_id,
        status,
        updated_at,
    }))
}
