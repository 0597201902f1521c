//! OAuth2 authorization-code flow with PKCE
//!
//! [`FlowCoordinator::begin`] builds the redirect to the provider and
//! [`FlowCoordinator::complete`] handles the provider's callback: it checks the
//! state, exchanges the code under a timeout and stores the resulting token.
//!
//! Two PKCE modes exist:
//!
//! - [`PkceMode::PerFlow`]: every redirect gets a fresh state and verifier.
//!   The pending flow is keyed by state, bound to the browser by a flow id
//!   (sent back as a cookie), consumed exactly once and expires after the
//!   flow TTL.
//! - [`PkceMode::Fixed`]: one configured state and verifier shared by every
//!   flow. Kept for deployments whose provider registration depends on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Secret, constant_time_eq};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::OAuthClient;
use crate::error::{Error, Result};
use crate::exchange::{ExternalToken, TokenExchange};
use crate::pkce;

/// Default bound on one token exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of a pending per-flow entry.
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(600);

/// How long a keyed token stays retrievable after it was stored.
pub const TOKEN_RETENTION: Duration = Duration::from_secs(3600);

/// Default cap on pending per-flow entries. The oldest is evicted beyond it.
pub const MAX_PENDING_FLOWS: usize = 10_000;

/// Slot key used for every flow in fixed mode.
pub const FIXED_FLOW_ID: &str = "fixed";

/// How state and verifier are chosen for each redirect.
pub enum PkceMode {
    PerFlow,
    Fixed {
        state: Secret<String>,
        verifier: Secret<String>,
    },
}

impl PkceMode {
    pub fn name(&self) -> &'static str {
        match self {
            PkceMode::PerFlow => "per_flow",
            PkceMode::Fixed { .. } => "fixed",
        }
    }
}

struct PendingFlow {
    flow_id: String,
    verifier: Secret<String>,
    created_at: Instant,
}

/// Where to send the browser, plus what the handler must remember.
#[derive(Debug)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    /// Binding value for the flow cookie. `None` in fixed mode.
    pub flow_id: Option<String>,
}

/// Outcome of a successful callback.
#[derive(Debug, Clone)]
pub struct CompletedFlow {
    pub flow_id: String,
    pub token: ExternalToken,
}

struct StoredToken {
    token: ExternalToken,
    stored_at: Instant,
}

#[derive(Default)]
struct TokenSlots {
    by_flow: HashMap<String, StoredToken>,
    latest: Option<ExternalToken>,
}

impl TokenSlots {
    fn store(&mut self, flow_id: String, token: ExternalToken) {
        self.by_flow
            .retain(|_, t| t.stored_at.elapsed() < TOKEN_RETENTION);
        self.latest = Some(token.clone());
        self.by_flow.insert(
            flow_id,
            StoredToken {
                token,
                stored_at: Instant::now(),
            },
        );
    }
}

/// Drives redirect and callback for one configured provider.
pub struct FlowCoordinator {
    client: Arc<OAuthClient>,
    mode: PkceMode,
    exchanger: Arc<dyn TokenExchange>,
    exchange_timeout: Duration,
    flow_ttl: Duration,
    max_pending: usize,
    pending: Mutex<HashMap<String, PendingFlow>>,
    tokens: Arc<Mutex<TokenSlots>>,
}

impl FlowCoordinator {
    pub fn new(client: OAuthClient, mode: PkceMode, exchanger: Arc<dyn TokenExchange>) -> Self {
        Self {
            client: Arc::new(client),
            mode,
            exchanger,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            flow_ttl: DEFAULT_FLOW_TTL,
            max_pending: MAX_PENDING_FLOWS,
            pending: Mutex::new(HashMap::new()),
            tokens: Arc::new(Mutex::new(TokenSlots::default())),
        }
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_flow_ttl(mut self, ttl: Duration) -> Self {
        self.flow_ttl = ttl;
        self
    }

    pub fn with_max_pending_flows(mut self, max: usize) -> Self {
        self.max_pending = max.max(1);
        self
    }

    pub fn provider(&self) -> &str {
        &self.client.provider
    }

    /// Whether the provider calls back over https, so browser cookies for
    /// the flow can be marked `Secure`.
    pub fn https_callback(&self) -> bool {
        self.client.redirect_url.starts_with("https://")
    }

    pub fn flow_ttl(&self) -> Duration {
        self.flow_ttl
    }

    /// Start a flow and return the provider authorization URL.
    pub async fn begin(&self) -> AuthorizationRequest {
        match &self.mode {
            PkceMode::Fixed { state, verifier } => {
                let challenge = pkce::compute_challenge(verifier.expose());
                let state = state.expose().clone();
                AuthorizationRequest {
                    url: self.client.authorization_url(&state, &challenge),
                    state,
                    flow_id: None,
                }
            }
            PkceMode::PerFlow => {
                let state = pkce::generate_state();
                let verifier = pkce::generate_verifier();
                let challenge = pkce::compute_challenge(&verifier);
                let flow_id = Uuid::new_v4().to_string();

                let mut pending = self.pending.lock().await;
                // Lazy cleanup while holding the lock
                pending.retain(|_, f| f.created_at.elapsed() < self.flow_ttl);
                while pending.len() >= self.max_pending {
                    let Some(oldest) = pending
                        .iter()
                        .min_by_key(|(_, f)| f.created_at)
                        .map(|(state, _)| state.clone())
                    else {
                        break;
                    };
                    if let Some(evicted) = pending.remove(&oldest) {
                        warn!(
                            provider = self.client.provider,
                            flow_id = evicted.flow_id,
                            max_pending = self.max_pending,
                            "pending flow limit reached, evicting oldest flow"
                        );
                    }
                }
                pending.insert(
                    state.clone(),
                    PendingFlow {
                        flow_id: flow_id.clone(),
                        verifier: Secret::new(verifier),
                        created_at: Instant::now(),
                    },
                );
                drop(pending);

                info!(provider = self.client.provider, flow_id, "OAuth flow started");

                AuthorizationRequest {
                    url: self.client.authorization_url(&state, &challenge),
                    state,
                    flow_id: Some(flow_id),
                }
            }
        }
    }

    /// Handle the provider callback.
    ///
    /// `binding` is the flow id the browser presented (cookie); it is ignored
    /// in fixed mode. State is checked before the code, and nothing reaches
    /// the token endpoint unless both pass.
    pub async fn complete(
        &self,
        state: &str,
        code: &str,
        binding: Option<&str>,
    ) -> Result<CompletedFlow> {
        let (flow_id, verifier) = match &self.mode {
            PkceMode::Fixed {
                state: expected,
                verifier,
            } => {
                if !expected.matches(state) {
                    warn!(provider = self.client.provider, "callback state mismatch");
                    return Err(Error::InvalidState);
                }
                (FIXED_FLOW_ID.to_string(), verifier.clone())
            }
            PkceMode::PerFlow => {
                let flow = self.take_pending(state).await?;
                let bound = binding
                    .is_some_and(|b| constant_time_eq(b.as_bytes(), flow.flow_id.as_bytes()));
                if !bound {
                    warn!(
                        provider = self.client.provider,
                        flow_id = flow.flow_id,
                        "callback not bound to the browser that started the flow"
                    );
                    return Err(Error::InvalidState);
                }
                (flow.flow_id, flow.verifier)
            }
        };

        if code.is_empty() {
            warn!(provider = self.client.provider, flow_id, "callback without code");
            return Err(Error::MissingCode);
        }

        self.exchange_and_store(flow_id, code.to_owned(), verifier)
            .await
    }

    /// Remove the pending flow for `state`, rejecting unknown or stale ones.
    async fn take_pending(&self, state: &str) -> Result<PendingFlow> {
        let mut pending = self.pending.lock().await;
        let flow = pending.remove(state);
        pending.retain(|_, f| f.created_at.elapsed() < self.flow_ttl);
        drop(pending);

        match flow {
            None => {
                warn!(provider = self.client.provider, "callback state unknown or already used");
                Err(Error::InvalidState)
            }
            Some(flow) if flow.created_at.elapsed() >= self.flow_ttl => {
                warn!(provider = self.client.provider, flow_id = flow.flow_id, "callback for expired flow");
                Err(Error::InvalidState)
            }
            Some(flow) => Ok(flow),
        }
    }

    /// Exchange on a detached task so a dropped request cannot interrupt the
    /// store update.
    async fn exchange_and_store(
        &self,
        flow_id: String,
        code: String,
        verifier: Secret<String>,
    ) -> Result<CompletedFlow> {
        let client = self.client.clone();
        let exchanger = self.exchanger.clone();
        let tokens = self.tokens.clone();
        let timeout = self.exchange_timeout;

        let task = tokio::spawn(async move {
            let exchanged = tokio::time::timeout(
                timeout,
                exchanger.exchange(&client, &code, verifier.expose()),
            )
            .await;

            let token = match exchanged {
                Ok(Ok(token)) => token,
                Ok(Err(e)) => {
                    warn!(provider = client.provider, flow_id, error = %e, "token exchange failed");
                    return Err(e);
                }
                Err(_) => {
                    warn!(provider = client.provider, flow_id, timeout_secs = timeout.as_secs(), "token exchange timed out");
                    return Err(Error::ExchangeFailed(format!(
                        "no response from token endpoint within {}s",
                        timeout.as_secs()
                    )));
                }
            };

            tokens.lock().await.store(flow_id.clone(), token.clone());
            info!(provider = client.provider, flow_id, "OAuth flow completed");
            Ok(CompletedFlow { flow_id, token })
        });

        task.await
            .map_err(|e| Error::Internal(format!("token exchange task failed: {e}")))?
    }

    /// Token stored for `flow_id`, if still retained.
    #[cfg(test)]
    pub(crate) async fn token_for_flow(&self, flow_id: &str) -> Option<ExternalToken> {
        let tokens = self.tokens.lock().await;
        tokens
            .by_flow
            .get(flow_id)
            .filter(|t| t.stored_at.elapsed() < TOKEN_RETENTION)
            .map(|t| t.token.clone())
    }

    /// Most recently stored token across all flows.
    pub async fn latest_token(&self) -> Option<ExternalToken> {
        self.tokens.lock().await.latest.clone()
    }

    /// Number of pending flows, expired entries included until next cleanup.
    #[cfg(test)]
    pub(crate) async fn pending_flows(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_client;
    use crate::exchange::ExchangeFuture;
    use reqwest::Url;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every call and answers with a token named after the code.
    #[derive(Default)]
    struct RecordingExchange {
        calls: AtomicUsize,
        seen: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl TokenExchange for RecordingExchange {
        fn exchange<'a>(
            &'a self,
            _client: &'a OAuthClient,
            code: &'a str,
            verifier: &'a str,
        ) -> ExchangeFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((code.to_owned(), verifier.to_owned()));
            Box::pin(async move { Ok(token(&format!("at-{code}"))) })
        }
    }

    struct RejectingExchange;

    impl TokenExchange for RejectingExchange {
        fn exchange<'a>(
            &'a self,
            _client: &'a OAuthClient,
            _code: &'a str,
            _verifier: &'a str,
        ) -> ExchangeFuture<'a> {
            Box::pin(async { Err(Error::ExchangeFailed("invalid_grant".into())) })
        }
    }

    struct StalledExchange;

    impl TokenExchange for StalledExchange {
        fn exchange<'a>(
            &'a self,
            _client: &'a OAuthClient,
            _code: &'a str,
            _verifier: &'a str,
        ) -> ExchangeFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    fn token(access: &str) -> ExternalToken {
        ExternalToken {
            access_token: access.into(),
            token_type: "Bearer".into(),
            refresh_token: None,
            expires_in: Some(3600),
            scope: None,
        }
    }

    fn per_flow(exchanger: Arc<dyn TokenExchange>) -> FlowCoordinator {
        FlowCoordinator::new(
            test_client("https://accounts.example.com/token"),
            PkceMode::PerFlow,
            exchanger,
        )
    }

    fn fixed(exchanger: Arc<dyn TokenExchange>) -> FlowCoordinator {
        FlowCoordinator::new(
            test_client("https://accounts.example.com/token"),
            PkceMode::Fixed {
                state: Secret::new("xyz".into()),
                verifier: Secret::new("fixed-user-token-0123456789-0123456789-abcdef".into()),
            },
            exchanger,
        )
    }

    fn challenge_of(url: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "code_challenge")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn begin_records_pending_flow_with_fresh_state() {
        let coordinator = per_flow(Arc::new(RecordingExchange::default()));

        let first = coordinator.begin().await;
        let second = coordinator.begin().await;

        assert_ne!(first.state, second.state);
        assert_ne!(first.flow_id, second.flow_id);
        assert_ne!(challenge_of(&first.url), challenge_of(&second.url));
        assert!(first.url.contains(&format!("state={}", first.state)));
        assert_eq!(coordinator.pending_flows().await, 2);
    }

    #[tokio::test]
    async fn complete_exchanges_verifier_matching_challenge() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = per_flow(exchanger.clone());

        let request = coordinator.begin().await;
        let flow_id = request.flow_id.clone().unwrap();
        let completed = coordinator
            .complete(&request.state, "code-1", Some(&flow_id))
            .await
            .unwrap();

        assert_eq!(completed.flow_id, flow_id);
        assert_eq!(completed.token.access_token, "at-code-1");

        let seen = exchanger.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "code-1");
        assert_eq!(pkce::compute_challenge(&seen[0].1), challenge_of(&request.url));

        assert_eq!(
            coordinator.token_for_flow(&flow_id).await.unwrap().access_token,
            "at-code-1"
        );
        assert_eq!(coordinator.pending_flows().await, 0);
    }

    #[tokio::test]
    async fn unknown_state_never_reaches_exchange() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = per_flow(exchanger.clone());
        let request = coordinator.begin().await;

        let result = coordinator
            .complete("forged-state", "code", request.flow_id.as_deref())
            .await;

        assert!(matches!(result, Err(Error::InvalidState)));
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
        assert!(coordinator.latest_token().await.is_none());
    }

    #[tokio::test]
    async fn state_is_consumed_once() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = per_flow(exchanger.clone());
        let request = coordinator.begin().await;
        let binding = request.flow_id.as_deref();

        coordinator
            .complete(&request.state, "code", binding)
            .await
            .unwrap();
        let replay = coordinator.complete(&request.state, "code", binding).await;

        assert!(matches!(replay, Err(Error::InvalidState)));
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_or_foreign_binding_is_invalid_state() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = per_flow(exchanger.clone());

        let request = coordinator.begin().await;
        let result = coordinator.complete(&request.state, "code", None).await;
        assert!(matches!(result, Err(Error::InvalidState)));

        let request = coordinator.begin().await;
        let result = coordinator
            .complete(&request.state, "code", Some("someone-elses-flow"))
            .await;
        assert!(matches!(result, Err(Error::InvalidState)));

        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_code_is_missing_code() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = per_flow(exchanger.clone());
        let request = coordinator.begin().await;

        let result = coordinator
            .complete(&request.state, "", request.flow_id.as_deref())
            .await;

        assert!(matches!(result, Err(Error::MissingCode)));
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_flow_is_rejected() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = per_flow(exchanger.clone()).with_flow_ttl(Duration::from_secs(60));
        let request = coordinator.begin().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let result = coordinator
            .complete(&request.state, "code", request.flow_id.as_deref())
            .await;

        assert!(matches!(result, Err(Error::InvalidState)));
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_flows_are_evicted_on_begin() {
        let coordinator = per_flow(Arc::new(RecordingExchange::default()))
            .with_flow_ttl(Duration::from_secs(60));
        coordinator.begin().await;
        coordinator.begin().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        coordinator.begin().await;

        assert_eq!(coordinator.pending_flows().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_flows_are_capped_by_evicting_oldest() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = per_flow(exchanger.clone()).with_max_pending_flows(3);

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(coordinator.begin().await);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.pending_flows().await, 3);

        let oldest = &requests[0];
        let result = coordinator
            .complete(&oldest.state, "code", oldest.flow_id.as_deref())
            .await;
        assert!(matches!(result, Err(Error::InvalidState)));
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);

        let newest = &requests[4];
        coordinator
            .complete(&newest.state, "code", newest.flow_id.as_deref())
            .await
            .unwrap();
        assert_eq!(coordinator.pending_flows().await, 2);
    }

    #[tokio::test]
    async fn provider_rejection_stores_nothing() {
        let coordinator = per_flow(Arc::new(RejectingExchange));
        let request = coordinator.begin().await;

        let result = coordinator
            .complete(&request.state, "code", request.flow_id.as_deref())
            .await;

        assert!(matches!(result, Err(Error::ExchangeFailed(_))));
        assert!(coordinator.latest_token().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_timeout_is_exchange_failed() {
        let coordinator = per_flow(Arc::new(StalledExchange))
            .with_exchange_timeout(Duration::from_secs(10));
        let request = coordinator.begin().await;

        let result = coordinator
            .complete(&request.state, "code", request.flow_id.as_deref())
            .await;

        match result {
            Err(Error::ExchangeFailed(msg)) => assert!(msg.contains("10s"), "got: {msg}"),
            other => panic!("expected ExchangeFailed, got {other:?}"),
        }
        assert!(coordinator.latest_token().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_flows_keep_their_own_tokens() {
        let coordinator = per_flow(Arc::new(RecordingExchange::default()));
        let a = coordinator.begin().await;
        let b = coordinator.begin().await;

        coordinator
            .complete(&a.state, "a", a.flow_id.as_deref())
            .await
            .unwrap();
        coordinator
            .complete(&b.state, "b", b.flow_id.as_deref())
            .await
            .unwrap();

        let a_token = coordinator.token_for_flow(a.flow_id.as_deref().unwrap()).await;
        let b_token = coordinator.token_for_flow(b.flow_id.as_deref().unwrap()).await;
        assert_eq!(a_token.unwrap().access_token, "at-a");
        assert_eq!(b_token.unwrap().access_token, "at-b");
        // Last write wins for the shared slot
        assert_eq!(coordinator.latest_token().await.unwrap().access_token, "at-b");
    }

    #[tokio::test]
    async fn fixed_mode_uses_configured_state_and_verifier() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = fixed(exchanger.clone());

        let request = coordinator.begin().await;
        assert_eq!(request.state, "xyz");
        assert!(request.flow_id.is_none());
        assert_eq!(
            challenge_of(&request.url),
            pkce::compute_challenge("fixed-user-token-0123456789-0123456789-abcdef")
        );
        assert_eq!(coordinator.pending_flows().await, 0);

        let completed = coordinator.complete("xyz", "code-9", None).await.unwrap();
        assert_eq!(completed.flow_id, FIXED_FLOW_ID);
        assert_eq!(
            exchanger.seen.lock().unwrap()[0].1,
            "fixed-user-token-0123456789-0123456789-abcdef"
        );
        assert_eq!(coordinator.latest_token().await.unwrap().access_token, "at-code-9");
    }

    #[tokio::test]
    async fn fixed_mode_rejects_other_state_before_code() {
        let exchanger = Arc::new(RecordingExchange::default());
        let coordinator = fixed(exchanger.clone());

        let result = coordinator.complete("abc", "", None).await;
        assert!(matches!(result, Err(Error::InvalidState)));

        let result = coordinator.complete("xyz", "", None).await;
        assert!(matches!(result, Err(Error::MissingCode)));

        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fixed_mode_last_write_wins() {
        let coordinator = fixed(Arc::new(RecordingExchange::default()));

        coordinator.complete("xyz", "first", None).await.unwrap();
        coordinator.complete("xyz", "second", None).await.unwrap();

        assert_eq!(
            coordinator.token_for_flow(FIXED_FLOW_ID).await.unwrap().access_token,
            "at-second"
        );
        assert_eq!(coordinator.latest_token().await.unwrap().access_token, "at-second");
    }
}
