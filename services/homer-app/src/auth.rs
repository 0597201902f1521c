//! Password login and the list of enabled login methods

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::error::{ApiError, json_response};
use crate::metrics;

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// POST /auth: verify credentials and issue a bearer token.
///
/// Replies 201 `{token, scope, user: {admin}}` where `scope` is the user GUID.
/// Unknown users and wrong passwords get the same 401.
pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| {
        metrics::record_login("invalid_request");
        ApiError::InvalidRequestFormat(e.body_text())
    })?;
    if request.username.is_empty() || request.password.is_empty() {
        metrics::record_login("invalid_request");
        return Err(ApiError::ValidationFailed(
            "username and password are required".into(),
        ));
    }

    let identity = match state
        .verifier
        .verify(&request.username, &request.password)
        .await
    {
        Ok(identity) => identity,
        Err(e) => {
            let err = ApiError::from(e);
            if matches!(err, ApiError::Unauthorized) {
                metrics::record_login("rejected");
            }
            return Err(err);
        }
    };

    let token = state.issuer.issue(&identity)?;
    metrics::record_login("success");
    info!(guid = %identity.guid, username = identity.username, "login succeeded");

    Ok(json_response(
        StatusCode::CREATED,
        serde_json::json!({
            "token": token,
            "scope": identity.guid,
            "user": { "admin": identity.role.is_admin() },
        }),
    ))
}

/// GET /auth/type/list: login methods offered to the UI.
pub async fn auth_type_list(State(state): State<AppState>) -> Response {
    let mut methods = vec![serde_json::json!({
        "name": "internal",
        "type": "internal",
        "enable": true,
        "url": "/auth",
    })];
    if let Some(oauth) = &state.oauth {
        methods.push(serde_json::json!({
            "name": oauth.provider(),
            "type": "oauth2",
            "enable": true,
            "url": format!("/oauth/redirect/{}", oauth.provider()),
        }));
    }

    json_response(
        StatusCode::OK,
        serde_json::json!({ "count": methods.len(), "data": methods }),
    )
}
