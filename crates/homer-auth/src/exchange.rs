//! Authorization code exchange at the provider's token endpoint
//!
//! `TokenExchange` is the seam between the flow coordinator and the network:
//! production uses [`HttpTokenExchange`], tests plug in fakes that record or
//! refuse calls.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::OAuthClient;
use crate::error::{Error, Result};

/// Token endpoint response (RFC 6749 section 5.1).
#[derive(Clone, Deserialize, Serialize)]
pub struct ExternalToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl fmt::Debug for ExternalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalToken")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Boxed future returned by [`TokenExchange::exchange`].
pub type ExchangeFuture<'a> = Pin<Box<dyn Future<Output = Result<ExternalToken>> + Send + 'a>>;

/// Redeems an authorization code plus PKCE verifier for an external token.
///
/// Boxed future return type keeps the trait usable as `Arc<dyn TokenExchange>`.
pub trait TokenExchange: Send + Sync {
    fn exchange<'a>(
        &'a self,
        client: &'a OAuthClient,
        code: &'a str,
        verifier: &'a str,
    ) -> ExchangeFuture<'a>;
}

/// Exchange over HTTP with reqwest.
pub struct HttpTokenExchange {
    http: reqwest::Client,
}

impl HttpTokenExchange {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange<'a>(
        &'a self,
        client: &'a OAuthClient,
        code: &'a str,
        verifier: &'a str,
    ) -> ExchangeFuture<'a> {
        Box::pin(exchange_code(&self.http, client, code, verifier))
    }
}

/// Exchange an authorization code for tokens.
///
/// The client secret, when configured, is sent in the form body alongside the
/// verifier. One attempt only; the caller decides what a failure means.
pub async fn exchange_code(
    http: &reqwest::Client,
    client: &OAuthClient,
    code: &str,
    verifier: &str,
) -> Result<ExternalToken> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", verifier),
        ("client_id", client.client_id.as_str()),
        ("redirect_uri", client.redirect_url.as_str()),
    ];
    if let Some(secret) = &client.client_secret {
        form.push(("client_secret", secret.expose().as_str()));
    }

    debug!(provider = client.provider, token_url = %client.token_url, "exchanging authorization code");

    let response = http
        .post(client.token_url.clone())
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::ExchangeFailed(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::ExchangeFailed(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<ExternalToken>()
        .await
        .map_err(|e| Error::ExchangeFailed(format!("invalid token response: {e}")))
}
