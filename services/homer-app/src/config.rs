//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (JWT signing key, OAuth client secret, fixed PKCE verifier) come
//! from env vars or `*_file` paths, never from the TOML itself.

use common::{Secret, resolve_secret};
use homer_auth::{
    MAX_PENDING_FLOWS, MIN_SIGNING_KEY_LEN, OAuthClient, PkceMode, is_valid_verifier,
};
use reqwest::Url;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const JWT_SECRET_ENV: &str = "HOMER_JWT_SECRET";
pub const CLIENT_SECRET_ENV: &str = "OAUTH2_CLIENT_SECRET";
pub const USER_TOKEN_ENV: &str = "OAUTH2_USER_TOKEN";
pub const ADMIN_PASSWORD_ENV: &str = "HOMER_ADMIN_PASSWORD";

/// Upper bound on bearer token lifetime (30 days).
pub const MAX_TOKEN_TTL_SECS: u64 = 30 * 24 * 3600;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub users: UsersConfig,
    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Bearer token settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(skip)]
    pub signing_key: Option<Secret<String>>,
    /// Path to a file holding the signing key (alternative to HOMER_JWT_SECRET)
    #[serde(default)]
    pub signing_key_file: Option<PathBuf>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

/// User store settings
#[derive(Debug, Deserialize)]
pub struct UsersConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkceModeSetting {
    #[default]
    PerFlow,
    Fixed,
}

/// External OAuth2 provider. Absent section disables OAuth login.
#[derive(Debug, Deserialize)]
pub struct OAuth2Config {
    pub provider: String,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
    #[serde(default = "default_flow_ttl")]
    pub flow_ttl_secs: u64,
    /// Cap on flows awaiting their callback; the oldest is dropped beyond it
    #[serde(default = "default_max_pending_flows")]
    pub max_pending_flows: usize,
    #[serde(default)]
    pub pkce_mode: PkceModeSetting,
    /// State value shared by every flow in fixed mode
    #[serde(default)]
    pub fixed_state: Option<String>,
    #[serde(skip)]
    pub user_token: Option<Secret<String>>,
    #[serde(default)]
    pub user_token_file: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_issuer() -> String {
    "homer".to_string()
}

fn default_exchange_timeout() -> u64 {
    10
}

fn default_flow_ttl() -> u64 {
    600
}

fn default_max_pending_flows() -> usize {
    MAX_PENDING_FLOWS
}

impl Config {
    /// Load configuration from a TOML file, then overlay secrets from the
    /// environment or their `*_file` paths.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.auth.token_ttl_secs == 0 || config.auth.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(common::Error::Config(format!(
                "token_ttl_secs must be between 1 and {MAX_TOKEN_TTL_SECS}"
            )));
        }

        config.auth.signing_key =
            resolve_secret(JWT_SECRET_ENV, config.auth.signing_key_file.as_deref())?;
        match &config.auth.signing_key {
            None => {
                return Err(common::Error::Config(format!(
                    "no signing key: set {JWT_SECRET_ENV} or auth.signing_key_file"
                )));
            }
            Some(key) if key.expose().len() < MIN_SIGNING_KEY_LEN => {
                return Err(common::Error::Config(format!(
                    "signing key must be at least {MIN_SIGNING_KEY_LEN} bytes"
                )));
            }
            Some(_) => {}
        }

        if let Some(oauth2) = config.oauth2.as_mut() {
            oauth2.load_secrets()?;
            oauth2.validate()?;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("homer-app.toml")
    }
}

impl OAuth2Config {
    fn load_secrets(&mut self) -> common::Result<()> {
        self.client_secret = resolve_secret(CLIENT_SECRET_ENV, self.client_secret_file.as_deref())?;
        if self.pkce_mode == PkceModeSetting::Fixed {
            self.user_token = resolve_secret(USER_TOKEN_ENV, self.user_token_file.as_deref())?;
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.provider.is_empty() || self.client_id.is_empty() {
            return Err(common::Error::Config(
                "oauth2.provider and oauth2.client_id must not be empty".into(),
            ));
        }
        for (name, value) in [
            ("auth_url", &self.auth_url),
            ("token_url", &self.token_url),
            ("redirect_url", &self.redirect_url),
        ] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "oauth2.{name} must start with http:// or https://, got: {value}"
                )));
            }
        }
        if self.exchange_timeout_secs == 0 {
            return Err(common::Error::Config(
                "exchange_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.flow_ttl_secs == 0 {
            return Err(common::Error::Config(
                "flow_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.max_pending_flows == 0 {
            return Err(common::Error::Config(
                "max_pending_flows must be greater than 0".into(),
            ));
        }

        if self.pkce_mode == PkceModeSetting::Fixed {
            if self.fixed_state.as_deref().is_none_or(str::is_empty) {
                return Err(common::Error::Config(
                    "pkce_mode = \"fixed\" requires oauth2.fixed_state".into(),
                ));
            }
            match &self.user_token {
                None => {
                    return Err(common::Error::Config(format!(
                        "pkce_mode = \"fixed\" requires {USER_TOKEN_ENV} or oauth2.user_token_file"
                    )));
                }
                Some(token) if !is_valid_verifier(token.expose()) => {
                    return Err(common::Error::Config(
                        "fixed PKCE verifier must be 43-128 characters of [A-Za-z0-9-._~]".into(),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Client registration for the auth core.
    pub fn client(&self) -> common::Result<OAuthClient> {
        let parse = |name: &str, value: &str| {
            Url::parse(value).map_err(|e| {
                common::Error::Config(format!("oauth2.{name} is not a valid URL: {e}"))
            })
        };
        Ok(OAuthClient {
            provider: self.provider.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_url: parse("auth_url", &self.auth_url)?,
            token_url: parse("token_url", &self.token_url)?,
            redirect_url: self.redirect_url.clone(),
            scopes: self.scopes.clone(),
        })
    }

    /// PKCE mode for the flow coordinator. Validation already guaranteed the
    /// fixed-mode values are present.
    pub fn pkce_mode(&self) -> common::Result<PkceMode> {
        match self.pkce_mode {
            PkceModeSetting::PerFlow => Ok(PkceMode::PerFlow),
            PkceModeSetting::Fixed => {
                let (Some(state), Some(verifier)) = (&self.fixed_state, &self.user_token) else {
                    return Err(common::Error::Config(
                        "fixed PKCE mode is missing its state or verifier".into(),
                    ));
                };
                Ok(PkceMode::Fixed {
                    state: Secret::new(state.clone()),
                    verifier: verifier.clone(),
                })
            }
        }
    }
}
