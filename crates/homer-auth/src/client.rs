//! OAuth2 client settings for the configured external provider

use common::Secret;
use reqwest::Url;

/// Registration details of this application at the external provider.
pub struct OAuthClient {
    /// Provider name as it appears in `/oauth/*/{provider}` routes
    pub provider: String,
    pub client_id: String,
    /// Absent for public clients that rely on PKCE alone
    pub client_secret: Option<Secret<String>>,
    pub auth_url: Url,
    pub token_url: Url,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

impl OAuthClient {
    /// Build the authorization URL for one redirect.
    ///
    /// Query parameters already present on `auth_url` are kept.
    pub fn authorization_url(&self, state: &str, challenge: &str) -> String {
        let mut url = self.auth_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_url);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
            query
                .append_pair("state", state)
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", "S256");
        }
        url.into()
    }
}

#[cfg(test)]
pub(crate) fn test_client(token_url: &str) -> OAuthClient {
    OAuthClient {
        provider: "google".into(),
        client_id: "homer-client".into(),
        client_secret: Some(Secret::new("homer-client-secret".into())),
        auth_url: Url::parse("https://accounts.example.com/o/oauth2/auth").unwrap(),
        token_url: Url::parse(token_url).unwrap(),
        redirect_url: "http://localhost:9080/oauth/auth/google".into(),
        scopes: vec!["openid".into(), "email".into()],
    }
}
