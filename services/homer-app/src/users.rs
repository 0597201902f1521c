//! User management handlers
//!
//! Success replies keep the long-standing 201 status and envelope
//! (`{count, data}` for listings, `{data, message}` for mutations) that
//! existing UI clients expect.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use homer_auth::{NewUser, UserUpdate};
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::error::{ApiError, json_response};
use crate::extract::AuthenticatedUser;

fn mutation_reply(guid: Uuid, message: &str) -> Response {
    json_response(
        StatusCode::CREATED,
        serde_json::json!({ "data": guid, "message": message }),
    )
}

fn parse_guid(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(guid)| guid)
        .map_err(|e| ApiError::BadRequest(format!("invalid user GUID: {}", e.body_text())))
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::InvalidRequestFormat(e.body_text()))
}

/// GET /users
pub async fn list(State(state): State<AppState>, user: AuthenticatedUser) -> Response {
    let users = state.users.list(&user.actor()).await;
    json_response(
        StatusCode::CREATED,
        serde_json::json!({ "count": users.len(), "data": users }),
    )
}

/// POST /users: admin only.
pub async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    body: Result<Json<NewUser>, JsonRejection>,
) -> Result<Response, ApiError> {
    let new_user = parse_body(body)?;
    let guid = state.users.create(&user.actor(), new_user).await?;
    info!(%guid, by = %user.0.sub, "user created");
    Ok(mutation_reply(guid, "successfully created user"))
}

/// PUT /users/{userGuid}
pub async fn update(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<UserUpdate>, JsonRejection>,
) -> Result<Response, ApiError> {
    let guid = parse_guid(path)?;
    let update = parse_body(body)?;
    state.users.update(&user.actor(), guid, update).await?;
    info!(%guid, by = %user.0.sub, "user updated");
    Ok(mutation_reply(guid, "successfully updated user"))
}

/// DELETE /users/{userGuid}: admin only.
pub async fn delete(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let guid = parse_guid(path)?;
    state.users.delete(&user.actor(), guid).await?;
    info!(%guid, by = %user.0.sub, "user deleted");
    Ok(mutation_reply(guid, "successfully deleted user"))
}
