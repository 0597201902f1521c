//! Bearer token extractor for protected routes

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use homer_auth::{Actor, Claims};
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;

/// Caller identity taken from a verified `Authorization: Bearer` header.
///
/// Authorization decisions use the role claim as issued; a token stays valid
/// until it expires even if the account changes in between.
pub struct AuthenticatedUser(pub Claims);

impl AuthenticatedUser {
    pub fn actor(&self) -> Actor {
        Actor {
            guid: self.0.sub,
            role: self.0.role,
        }
    }
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthenticated)?;

        let claims = state.issuer.verify(token).map_err(|e| {
            debug!(error = %e, "bearer token rejected");
            ApiError::Unauthenticated
        })?;
        Ok(Self(claims))
    }
}
