//! Shared fixtures for handler tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, header};
use axum::response::Response;
use common::Secret;
use homer_auth::{
    Actor, CredentialVerifier, Error, ExchangeFuture, ExternalToken, FlowCoordinator, Identity,
    NewUser, OAuthClient, PkceMode, TokenExchange, TokenIssuer, UserStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Url;
use tempfile::TempDir;

use crate::{AppState, build_router};

pub(crate) const ADMIN_PASSWORD: &str = "sipcapture";
pub(crate) const VIEWER_PASSWORD: &str = "viewer-pw";
/// Serializes tests that mutate environment variables.
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

const SIGNING_KEY: &str = "0123456789abcdef0123456789abcdef";
const FIXED_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

/// App state over a temp-dir user store holding `admin` and `viewer`.
pub(crate) struct TestApp {
    pub state: AppState,
    pub admin: Identity,
    pub viewer: Identity,
    _dir: TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        build_router(self.state.clone(), 16)
    }

    pub fn token_for(&self, identity: &Identity) -> String {
        self.state.issuer.issue(identity).unwrap()
    }
}

/// Prometheus handle without installing a global recorder.
pub(crate) fn test_prometheus_handle() -> PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle()
}

pub(crate) async fn test_app(oauth: Option<FlowCoordinator>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(UserStore::load(dir.path().join("users.json")).await.unwrap());

    store.bootstrap_admin(ADMIN_PASSWORD).await.unwrap();
    let admin = store.find_by_username("admin").await.unwrap().identity();
    let actor = Actor {
        guid: admin.guid,
        role: admin.role,
    };
    store
        .create(
            &actor,
            NewUser {
                username: "viewer".into(),
                password: VIEWER_PASSWORD.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let viewer = store.find_by_username("viewer").await.unwrap().identity();

    let issuer = TokenIssuer::new(
        &Secret::new(SIGNING_KEY.to_string()),
        Duration::from_secs(3600),
        "homer",
    )
    .unwrap();

    TestApp {
        state: AppState {
            users: store.clone(),
            verifier: Arc::new(CredentialVerifier::new(store)),
            issuer: Arc::new(issuer),
            oauth: oauth.map(Arc::new),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        },
        admin,
        viewer,
        _dir: dir,
    }
}

/// Token endpoint stand-in: answers with a fixed token, or refuses.
pub(crate) struct FakeExchange {
    token: Option<String>,
    calls: AtomicUsize,
}

impl FakeExchange {
    pub fn succeeding(access_token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: Some(access_token.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            token: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenExchange for FakeExchange {
    fn exchange<'a>(
        &'a self,
        _client: &'a OAuthClient,
        _code: &'a str,
        _verifier: &'a str,
    ) -> ExchangeFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match &self.token {
            Some(access_token) => Ok(ExternalToken {
                access_token: access_token.clone(),
                token_type: "Bearer".into(),
                refresh_token: None,
                expires_in: Some(3600),
                scope: None,
            }),
            None => Err(Error::ExchangeFailed("invalid_grant".into())),
        };
        Box::pin(async move { result })
    }
}

fn oauth_client() -> OAuthClient {
    oauth_client_with_callback("http://localhost:9080/oauth/auth/google")
}

fn oauth_client_with_callback(redirect_url: &str) -> OAuthClient {
    OAuthClient {
        provider: "google".into(),
        client_id: "homer-client".into(),
        client_secret: None,
        auth_url: Url::parse("https://accounts.example.com/o/oauth2/auth").unwrap(),
        token_url: Url::parse("https://oauth2.example.com/token").unwrap(),
        redirect_url: redirect_url.into(),
        scopes: vec!["openid".into()],
    }
}

pub(crate) fn per_flow_coordinator() -> FlowCoordinator {
    per_flow_coordinator_with(FakeExchange::succeeding("ext-token"))
}

pub(crate) fn per_flow_coordinator_with(exchange: Arc<FakeExchange>) -> FlowCoordinator {
    FlowCoordinator::new(oauth_client(), PkceMode::PerFlow, exchange)
}

/// Per-flow coordinator whose provider calls back over https.
pub(crate) fn https_per_flow_coordinator() -> FlowCoordinator {
    FlowCoordinator::new(
        oauth_client_with_callback("https://homer.example.com/oauth/auth/google"),
        PkceMode::PerFlow,
        FakeExchange::succeeding("ext-token"),
    )
}

pub(crate) fn fixed_coordinator(exchange: Arc<FakeExchange>) -> FlowCoordinator {
    FlowCoordinator::new(
        oauth_client(),
        PkceMode::Fixed {
            state: Secret::new("xyz".into()),
            verifier: Secret::new(FIXED_VERIFIER.into()),
        },
        exchange,
    )
}

pub(crate) fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

pub(crate) fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Authenticated request, with a JSON body when given.
pub(crate) fn send_json(method: Method, uri: &str, token: &str, body: Option<&str>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub(crate) async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
