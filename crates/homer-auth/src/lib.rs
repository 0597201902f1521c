//! Authentication core for the Homer user API
//!
//! Password login against the user store, bearer token issuing, and the
//! OAuth2 authorization-code flow with PKCE for an external provider.

mod client;
mod error;
mod exchange;
mod flow;
mod issuer;
mod pkce;
mod users;
mod verifier;

pub use client::OAuthClient;
pub use error::{Error, Result};
pub use exchange::{
    ExchangeFuture, ExternalToken, HttpTokenExchange, TokenExchange, exchange_code,
};
pub use flow::{
    AuthorizationRequest, CompletedFlow, DEFAULT_EXCHANGE_TIMEOUT, DEFAULT_FLOW_TTL,
    FIXED_FLOW_ID, FlowCoordinator, MAX_PENDING_FLOWS, PkceMode, TOKEN_RETENTION,
};
pub use issuer::{Claims, MIN_SIGNING_KEY_LEN, TokenIssuer};
pub use pkce::{compute_challenge, generate_state, generate_verifier, is_valid_verifier};
pub use users::{
    Actor, Identity, NewUser, Role, UserRecord, UserStore, UserUpdate, UserView, hash_password,
};
pub use verifier::CredentialVerifier;
