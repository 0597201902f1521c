//! Username/password verification
//!
//! Lookups never short-circuit on an unknown username: the supplied password
//! is still checked against a fixed dummy hash so both failure paths cost one
//! Argon2 verification.

use std::sync::{Arc, LazyLock};

use tracing::info;

use crate::error::{Error, Result};
use crate::users::{Identity, UserStore};

static DUMMY_HASH: LazyLock<String> =
    LazyLock::new(|| password_auth::generate_hash("homer-unknown-user-placeholder"));

/// Checks credentials against the user store. Read-only.
pub struct CredentialVerifier {
    store: Arc<UserStore>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<UserStore>) -> Self {
        Self { store }
    }

    /// Verify a username/password pair.
    ///
    /// Returns `UserNotFound` or `InvalidCredential`; callers answering over
    /// the network must not tell the two apart.
    pub async fn verify(&self, username: &str, password: &str) -> Result<Identity> {
        let record = self.store.find_by_username(username).await;
        let hash = record.as_ref().map(|r| r.password_hash.clone());

        // The dummy hash is built lazily, so first use must happen off the
        // async workers as well.
        let password = password.to_owned();
        let matched = tokio::task::spawn_blocking(move || {
            let hash = hash.as_deref().unwrap_or(DUMMY_HASH.as_str());
            password_auth::verify_password(password, hash).is_ok()
        })
        .await
        .map_err(|e| Error::Internal(format!("password verification task failed: {e}")))?;

        match record {
            None => {
                info!(username, reason = "unknown_user", "login rejected");
                Err(Error::UserNotFound(username.to_owned()))
            }
            Some(_) if !matched => {
                info!(username, reason = "bad_password", "login rejected");
                Err(Error::InvalidCredential(username.to_owned()))
            }
            Some(r) => Ok(r.identity()),
        }
    }
}
