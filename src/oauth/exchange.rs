//! The authorization-code flow from redirect to issued credential.
//!
//! ```text
//! Initiated -> CallbackReceived -> Exchanged -> Resolved -> Issued
//!      \______________\_______________\____________\______> Failed
//! ```
//!
//! The local path skips the provider round trip: a correct password stores a
//! state carrying the username and redirects straight to the local callback.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::Instrument;

use super::accounts::{AccountLookupError, AccountProvider};
use super::pkce::{challenge_s256, generate_verifier};
use super::provider::ProviderClient;
use super::state::{AuthState, StateStore};
use super::Provider;
use crate::config::{CookieSettings, ProviderConfig};
use crate::error::AppError;
use crate::identity::{CredentialCodec, RequestContext, CREDENTIAL_TTL, TOKEN_COOKIE_NAME};
use crate::security::verify_password;

pub use super::provider::ExchangeError;

/// Where a successful local password check sends the browser.
pub const LOCAL_CALLBACK_PATH: &str = "/oauth/o/redirect";

const USERNAME_KEY: &str = "username";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    Initiated,
    CallbackReceived,
    Exchanged,
    Resolved,
    Issued,
    Failed,
}

impl fmt::Display for FlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowStage::Initiated => "INITIATED",
            FlowStage::CallbackReceived => "CALLBACK_RECEIVED",
            FlowStage::Exchanged => "EXCHANGED",
            FlowStage::Resolved => "RESOLVED",
            FlowStage::Issued => "ISSUED",
            FlowStage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInRequest {
    pub username: String,
    pub password: String,
}

/// How a callback ends when it does not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Credential minted: set `cookie` and redirect to `location`.
    Issued { cookie: String, location: String },
    /// No account for this username yet.
    Register { location: String },
}

pub struct AuthorizationExchange {
    providers: HashMap<Provider, ProviderConfig>,
    local_sign_in: bool,
    states: StateStore,
    codec: Arc<CredentialCodec>,
    accounts: Arc<dyn AccountProvider>,
    client: ProviderClient,
    cookies: CookieSettings,
}

impl AuthorizationExchange {
    pub fn new(codec: Arc<CredentialCodec>, accounts: Arc<dyn AccountProvider>, client: ProviderClient, cookies: CookieSettings) -> Self {
        Self {
            providers: HashMap::new(),
            local_sign_in: false,
            states: StateStore::new(),
            codec,
            accounts,
            client,
            cookies,
        }
    }

    pub fn with_provider(mut self, provider: Provider, cfg: ProviderConfig) -> Self {
        self.providers.insert(provider, cfg);
        self
    }

    pub fn with_local_sign_in(mut self, enabled: bool) -> Self {
        self.local_sign_in = enabled;
        self
    }

    pub fn with_state_store(mut self, states: StateStore) -> Self {
        self.states = states;
        self
    }

    pub fn states(&self) -> &StateStore { &self.states }

    pub fn is_enabled(&self, provider: Provider) -> bool {
        match provider {
            Provider::Local => self.local_sign_in,
            p => self.providers.contains_key(&p),
        }
    }

    fn stage(&self, ctx: &RequestContext, provider: Provider, state_id: &str, stage: FlowStage) {
        match stage {
            FlowStage::Failed => ctx.warn(format_args!("sign-in {} via {}: {}", state_id, provider, stage)),
            FlowStage::Issued => ctx.info(format_args!("sign-in {} via {}: {}", state_id, provider, stage)),
            _ => ctx.debug(format_args!("sign-in {} via {}: {}", state_id, provider, stage)),
        }
    }

    fn provider_config(&self, provider: Provider) -> Result<&ProviderConfig, AppError> {
        self.providers.get(&provider).ok_or_else(|| AppError::not_found("provider_disabled", "sign-in provider is not enabled"))
    }

    /// Start a federated sign-in: store a fresh state and return the provider's consent URL.
    pub fn begin_sign_in(&self, ctx: &RequestContext, provider: Provider, target_url: &str) -> Result<String, AppError> {
        let cfg = self.provider_config(provider)?;
        let verifier = generate_verifier().map_err(|e| ctx.handle_error(&e, "unable to start sign-in"))?;
        let state = AuthState::new(verifier, safe_target(target_url));
        let url = ProviderClient::authorize_url(cfg, &state.state_id, &challenge_s256(&state.verifier));
        self.stage(ctx, provider, &state.state_id, FlowStage::Initiated);
        self.states.insert(state);
        Ok(url)
    }

    /// Check a local password. Every failure looks the same to the caller.
    /// Returns the local callback URL on success.
    pub async fn begin_sign_in_local(&self, ctx: &RequestContext, req: &SignInRequest) -> Result<String, AppError> {
        if !self.local_sign_in {
            return Err(AppError::not_found("provider_disabled", "sign-in provider is not enabled"));
        }
        let rejected = || AppError::user("sign_in_failed", "sign in failed");

        let account = match self.accounts.find(ctx, &req.username).await {
            Ok(a) => a,
            Err(AccountLookupError::NotFound) => {
                ctx.debug(format_args!("local sign-in for unknown account"));
                return Err(rejected());
            }
            Err(e) => {
                ctx.warn(format_args!("local sign-in lookup failed: {}", e));
                return Err(rejected());
            }
        };

        let hash = account.password_hash.clone();
        let password = req.password.clone();
        let matches = tokio::task::spawn_blocking(move || verify_password(&hash, &password))
            .await
            .map_err(|e| ctx.handle_error(&e, "unable to verify password"))?;
        if !matches {
            ctx.debug(format_args!("local sign-in with wrong password"));
            return Err(rejected());
        }

        let mut state = AuthState::new("", "/");
        state.context.insert(USERNAME_KEY.to_string(), account.username);
        let url = format!("{}?state={}&code=local", LOCAL_CALLBACK_PATH, urlencoding::encode(&state.state_id));
        self.stage(ctx, Provider::Local, &state.state_id, FlowStage::Initiated);
        self.states.insert(state);
        Ok(url)
    }

    /// Finish a sign-in. The state is consumed whether or not the rest succeeds.
    pub async fn handle_callback(
        &self,
        ctx: &RequestContext,
        provider: Provider,
        state_id: &str,
        code: &str,
    ) -> Result<CallbackOutcome, AppError> {
        if !self.is_enabled(provider) {
            return Err(AppError::not_found("provider_disabled", "sign-in provider is not enabled"));
        }
        if state_id.is_empty() {
            return Err(AppError::user("missing_state", "state is required"));
        }
        let Some(state) = self.states.take(state_id) else {
            self.stage(ctx, provider, state_id, FlowStage::Failed);
            return Err(AppError::user("state_not_found", "state not found"));
        };
        if code.is_empty() {
            self.stage(ctx, provider, state_id, FlowStage::Failed);
            return Err(AppError::user("missing_code", "code is required"));
        }
        self.stage(ctx, provider, state_id, FlowStage::CallbackReceived);

        let result = self.complete(ctx, provider, &state, code).await;
        let stage = match &result {
            Ok(CallbackOutcome::Issued { .. }) => FlowStage::Issued,
            Ok(CallbackOutcome::Register { .. }) => FlowStage::Resolved,
            Err(_) => FlowStage::Failed,
        };
        self.stage(ctx, provider, state_id, stage);
        result
    }

    async fn complete(&self, ctx: &RequestContext, provider: Provider, state: &AuthState, code: &str) -> Result<CallbackOutcome, AppError> {
        let username = if provider.is_federated() {
            let cfg = self.provider_config(provider)?;
            let span = ctx.start_span("provider_exchange", true);
            let token = self
                .client
                .exchange_code(cfg, code, &state.verifier)
                .instrument(span.clone())
                .await
                .map_err(|e| ctx.handle_error(&e, "provider token exchange failed"))?;
            self.stage(ctx, provider, &state.state_id, FlowStage::Exchanged);
            self.client
                .fetch_username(provider, cfg, &token)
                .instrument(span)
                .await
                .map_err(|e| ctx.handle_error(&e, "provider user info failed"))?
        } else {
            match state.context.get(USERNAME_KEY) {
                Some(u) => u.clone(),
                None => return Err(ctx.handle_error(&"no username in local state", "local sign-in state is incomplete")),
            }
        };

        let account = match self.accounts.find(ctx, &username).await {
            Ok(a) => a,
            Err(AccountLookupError::NotFound) => {
                ctx.info(format_args!("no account for {} via {}, sending to registration", username, provider));
                return Ok(CallbackOutcome::Register { location: format!("/register/{}", STANDARD.encode(username.as_bytes())) });
            }
            Err(e) => return Err(ctx.handle_error(&e, "account lookup failed")),
        };
        self.stage(ctx, provider, &state.state_id, FlowStage::Resolved);

        if account.provider != provider.name() {
            ctx.warn(format_args!(
                "signed in via {} but account '{}' belongs to provider '{}'",
                provider, username, account.provider
            ));
            return Err(AppError::forbidden("provider_mismatch", "account is registered with a different sign-in provider"));
        }

        let token = self
            .codec
            .issue(&account.id, &account.username, account.roles.iter().cloned())
            .map_err(|e| ctx.handle_error(&e, "unable to issue credential"))?;
        Ok(CallbackOutcome::Issued { cookie: token_cookie(&token, &self.cookies), location: state.target_url.clone() })
    }

    /// `Set-Cookie` value that removes the credential.
    pub fn sign_out(&self) -> String {
        clear_token_cookie(&self.cookies)
    }
}

/// Only same-site paths are accepted as post sign-in targets. Browsers drop
/// tabs and newlines while parsing a `Location`, so `/\t/host` would become
/// `//host`; any control character or whitespace rejects the target.
fn safe_target(target: &str) -> &str {
    let same_site = target.starts_with('/') && !target.starts_with("//") && !target.starts_with("/\\");
    let clean = !target.chars().any(|c| c.is_control() || c.is_whitespace());
    if same_site && clean { target } else { "/" }
}

fn cookie_attributes(settings: &CookieSettings) -> String {
    let mut out = String::from("Path=/; ");
    if let Some(domain) = settings.domain.as_deref() {
        out.push_str(&format!("Domain={}; ", domain));
    }
    out.push_str("HttpOnly; ");
    if settings.secure {
        out.push_str("Secure; ");
    }
    out.push_str("SameSite=Strict");
    out
}

/// `Set-Cookie` value carrying a freshly issued credential.
pub fn token_cookie(token: &str, settings: &CookieSettings) -> String {
    format!("{}={}; Max-Age={}; {}", TOKEN_COOKIE_NAME, token, CREDENTIAL_TTL.num_seconds(), cookie_attributes(settings))
}

pub fn clear_token_cookie(settings: &CookieSettings) -> String {
    format!(
        "{}=; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; {}",
        TOKEN_COOKIE_NAME,
        cookie_attributes(settings)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CredentialVerifier;
    use crate::oauth::{Account, InMemoryAccounts};
    use crate::security::hash_password;

    fn codec() -> Arc<CredentialCodec> { Arc::new(CredentialCodec::new("gatehouse", b"k")) }

    fn google_cfg() -> ProviderConfig {
        ProviderConfig {
            client_id: "cid".into(),
            client_secret: "cs".into(),
            redirect_url: "https://app/oauth/g/redirect".into(),
            auth_url: "https://idp/auth".into(),
            token_url: "https://idp/token".into(),
            userinfo_url: "https://idp/me".into(),
            scopes: vec!["email".into()],
        }
    }

    fn exchange(accounts: Vec<Account>) -> AuthorizationExchange {
        AuthorizationExchange::new(codec(), Arc::new(InMemoryAccounts::new(accounts)), ProviderClient::new().unwrap(), CookieSettings::default())
            .with_provider(Provider::Google, google_cfg())
            .with_local_sign_in(true)
    }

    fn local_account(password: &str) -> Account {
        Account {
            id: "9".into(),
            username: "jane".into(),
            provider: "own".into(),
            password_hash: hash_password(password).unwrap(),
            roles: vec!["editor".into()],
        }
    }

    fn ctx() -> RequestContext { RequestContext::background("test", "0", Vec::<String>::new()) }

    fn state_param(url: &str) -> String {
        let q = url.split_once('?').unwrap().1;
        q.split('&').find_map(|p| p.strip_prefix("state=")).unwrap().to_string()
    }

    #[test]
    fn cookie_formats() {
        let s = CookieSettings { domain: Some("example.com".into()), secure: true };
        assert_eq!(token_cookie("abc", &s), "token=abc; Max-Age=3600; Path=/; Domain=example.com; HttpOnly; Secure; SameSite=Strict");
        let plain = CookieSettings { domain: None, secure: false };
        assert_eq!(token_cookie("abc", &plain), "token=abc; Max-Age=3600; Path=/; HttpOnly; SameSite=Strict");
        assert_eq!(
            clear_token_cookie(&plain),
            "token=; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path=/; HttpOnly; SameSite=Strict"
        );
    }

    #[test]
    fn targets_are_kept_on_site() {
        assert_eq!(safe_target(""), "/");
        assert_eq!(safe_target("/app/x?y=1"), "/app/x?y=1");
        assert_eq!(safe_target("https://evil.example"), "/");
        assert_eq!(safe_target("//evil.example"), "/");
        assert_eq!(safe_target("/\\evil.example"), "/");
        assert_eq!(safe_target("/\t/evil.example/phish"), "/");
        assert_eq!(safe_target("/\n/evil.example"), "/");
        assert_eq!(safe_target("/\r\n/evil.example"), "/");
        assert_eq!(safe_target("/ /evil.example"), "/");
        assert_eq!(safe_target("/a\u{0}b"), "/");
        assert_eq!(safe_target("/reports/2024?q=a%20b"), "/reports/2024?q=a%20b");
    }

    #[tokio::test]
    async fn begin_sign_in_stores_state_with_verifier() {
        let ex = exchange(vec![]);
        let url = ex.begin_sign_in(&ctx(), Provider::Google, "/after").unwrap();
        assert!(url.starts_with("https://idp/auth?"));
        let id = state_param(&url);
        let state = ex.states().take(&id).unwrap();
        assert_eq!(state.target_url, "/after");
        assert!(url.contains(&format!("code_challenge={}", challenge_s256(&state.verifier))));
    }

    #[tokio::test]
    async fn disabled_provider_cannot_start() {
        let ex = exchange(vec![]);
        let err = ex.begin_sign_in(&ctx(), Provider::Microsoft, "/").unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn local_sign_in_issues_a_credential() {
        let ex = exchange(vec![local_account("pw")]);
        let c = ctx();
        let url = ex
            .begin_sign_in_local(&c, &SignInRequest { username: "jane".into(), password: "pw".into() })
            .await
            .unwrap();
        assert!(url.starts_with("/oauth/o/redirect?state="));
        assert!(url.ends_with("&code=local"));
        let id = state_param(&url);
        let outcome = ex.handle_callback(&c, Provider::Local, &id, "local").await.unwrap();
        let CallbackOutcome::Issued { cookie, location } = outcome else { panic!("expected issued") };
        assert_eq!(location, "/");
        let token = cookie.strip_prefix("token=").unwrap().split(';').next().unwrap();
        let identity = codec().verify(token).unwrap();
        assert_eq!(identity.username, "jane");
        assert_eq!(identity.user_id, "9");
        assert!(identity.roles.contains("editor"));
        // replay
        let err = ex.handle_callback(&c, Provider::Local, &id, "local").await.unwrap_err();
        assert_eq!(err, AppError::user("state_not_found", "state not found"));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let ex = exchange(vec![local_account("pw")]);
        let c = ctx();
        let wrong = ex.begin_sign_in_local(&c, &SignInRequest { username: "jane".into(), password: "nope".into() }).await.unwrap_err();
        let unknown = ex.begin_sign_in_local(&c, &SignInRequest { username: "ghost".into(), password: "pw".into() }).await.unwrap_err();
        assert_eq!(wrong, unknown);
        assert_eq!(wrong.http_status(), 400);
        assert!(ex.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn callback_after_state_expiry_is_state_not_found() {
        let ex = exchange(vec![]);
        let c = ctx();
        let id = state_param(&ex.begin_sign_in(&c, Provider::Google, "/after").unwrap());
        tokio::time::sleep(std::time::Duration::from_secs(29)).await;
        assert!(ex.states().contains(&id));
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let err = ex.handle_callback(&c, Provider::Google, &id, "code").await.unwrap_err();
        assert_eq!(err, AppError::user("state_not_found", "state not found"));
    }

    #[tokio::test]
    async fn unknown_state_and_missing_params_are_bad_requests() {
        let ex = exchange(vec![]);
        let c = ctx();
        assert_eq!(ex.handle_callback(&c, Provider::Google, "", "code").await.unwrap_err().http_status(), 400);
        let err = ex.handle_callback(&c, Provider::Google, "no-such-state", "code").await.unwrap_err();
        assert_eq!(err.code_str(), "state_not_found");
        let url = ex.begin_sign_in(&c, Provider::Google, "/").unwrap();
        let id = state_param(&url);
        assert_eq!(ex.handle_callback(&c, Provider::Google, &id, "").await.unwrap_err().code_str(), "missing_code");
        // consumed even though the callback failed
        assert!(!ex.states().contains(&id));
    }

    #[tokio::test]
    async fn local_account_that_vanished_goes_to_registration() {
        let ex = exchange(vec![]);
        let c = ctx();
        let mut state = AuthState::new("", "/");
        state.context.insert(USERNAME_KEY.into(), "new@example.com".into());
        let id = state.state_id.clone();
        ex.states().insert(state);
        let outcome = ex.handle_callback(&c, Provider::Local, &id, "local").await.unwrap();
        assert_eq!(outcome, CallbackOutcome::Register { location: format!("/register/{}", STANDARD.encode("new@example.com")) });
    }

    #[tokio::test]
    async fn local_callback_rejects_federated_account() {
        let mut acc = local_account("pw");
        acc.provider = "google".into();
        let ex = exchange(vec![acc]);
        let c = ctx();
        let mut state = AuthState::new("", "/");
        state.context.insert(USERNAME_KEY.into(), "jane".into());
        let id = state.state_id.clone();
        ex.states().insert(state);
        let err = ex.handle_callback(&c, Provider::Local, &id, "local").await.unwrap_err();
        assert_eq!(err.http_status(), 403);
    }
}
