//! OAuth2 redirect and callback handlers
//!
//! In per-flow mode the redirect sets a `homer_oauth_flow` cookie holding the
//! flow id; the callback must present it back. The cookie is scoped to
//! `/oauth` and cleared once the callback has been handled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use homer_auth::FlowCoordinator;
use serde::Deserialize;
use tracing::{error, info};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;

pub const FLOW_COOKIE: &str = "homer_oauth_flow";

#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    state: String,
    #[serde(default)]
    code: String,
}

/// Coordinator for `provider`, or 404 when OAuth is off or the name differs.
fn coordinator_for(state: &AppState, provider: &str) -> Result<Arc<FlowCoordinator>, ApiError> {
    state
        .oauth
        .as_ref()
        .filter(|oauth| oauth.provider() == provider)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("unknown OAuth provider: {provider}")))
}

/// GET /oauth/redirect/{provider}: 302 to the provider's authorization URL.
pub async fn redirect(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Response, ApiError> {
    let oauth = coordinator_for(&state, &provider)?;
    let request = oauth.begin().await;
    metrics::record_redirect(&provider);

    let mut response = found(&request.url)?;
    if let Some(flow_id) = request.flow_id {
        let cookie = flow_cookie(&flow_id, oauth.flow_ttl(), oauth.https_callback());
        response.headers_mut().insert(SET_COOKIE, header_value(&cookie)?);
    }
    Ok(response)
}

/// GET /oauth/auth/{provider}?state&code: provider callback.
///
/// On success redirects to `/?token=<access token>`.
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    params: Result<Query<CallbackParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let oauth = coordinator_for(&state, &provider)?;
    let Query(params) = params.map_err(|e| ApiError::InvalidRequestFormat(e.body_text()))?;
    let binding = read_cookie(&headers, FLOW_COOKIE);

    let started = Instant::now();
    let result = oauth.complete(&params.state, &params.code, binding).await;

    let completed = match result {
        Ok(completed) => completed,
        Err(e) => {
            let err = ApiError::from(e);
            let outcome = match err {
                ApiError::InvalidState => "invalid_state",
                ApiError::MissingCode => "missing_code",
                ApiError::ExchangeFailed => {
                    metrics::record_exchange_duration(started.elapsed().as_secs_f64());
                    "exchange_failed"
                }
                _ => "error",
            };
            metrics::record_callback(outcome);
            return Err(err);
        }
    };
    metrics::record_exchange_duration(started.elapsed().as_secs_f64());
    metrics::record_callback("success");
    info!(provider, flow_id = completed.flow_id, "external login completed");

    let location = format!(
        "/?token={}",
        urlencoding::encode(&completed.token.access_token)
    );
    let mut response = found(&location)?;
    if binding.is_some() {
        let cleared = flow_cookie("", Duration::ZERO, oauth.https_callback());
        response.headers_mut().insert(SET_COOKIE, header_value(&cleared)?);
    }
    Ok(response)
}

fn found(location: &str) -> Result<Response, ApiError> {
    Ok((StatusCode::FOUND, [(LOCATION, header_value(location)?)]).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| {
        error!(error = %e, "response header value rejected");
        ApiError::Internal
    })
}

fn flow_cookie(flow_id: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{FLOW_COOKIE}={flow_id}; Path=/oauth; HttpOnly; SameSite=Lax; Max-Age={}",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Value of cookie `name` from the request's `Cookie` headers.
fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}
