//! Bearer token issuing and verification
//!
//! Tokens are HS256 JWTs. The signing key is handed in once at startup and
//! never regenerated; tokens are stateless and expire on their own, there is
//! no revocation or refresh.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::users::{Identity, Role};

/// Minimum signing key length for HS256.
pub const MIN_SIGNING_KEY_LEN: usize = 32;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User GUID
    pub sub: Uuid,
    pub username: String,
    pub role: Role,
    pub iat: u64,
    pub exp: u64,
    pub iss: String,
}

/// Mints and checks session tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    issuer: String,
}

impl TokenIssuer {
    /// Build an issuer. Rejects keys shorter than [`MIN_SIGNING_KEY_LEN`].
    pub fn new(key: &Secret<String>, ttl: Duration, issuer: impl Into<String>) -> Result<Self> {
        let bytes = key.expose().as_bytes();
        if bytes.len() < MIN_SIGNING_KEY_LEN {
            return Err(Error::Signing(format!(
                "signing key must be at least {MIN_SIGNING_KEY_LEN} bytes"
            )));
        }
        let issuer = issuer.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            validation,
            ttl,
            issuer,
        })
    }

    /// Issue a token for `identity`, valid for the configured TTL.
    pub fn issue(&self, identity: &Identity) -> Result<String> {
        self.issue_at(identity, now_secs())
    }

    fn issue_at(&self, identity: &Identity, issued_at: u64) -> Result<String> {
        let claims = Claims {
            sub: identity.guid,
            username: identity.username.clone(),
            role: identity.role,
            iat: issued_at,
            exp: issued_at.saturating_add(self.ttl.as_secs()),
            iss: self.issuer.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Signing(e.to_string()))
    }

    /// Check signature, algorithm, issuer and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::InvalidToken(e.to_string()))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
