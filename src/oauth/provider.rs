//! Outbound calls to a federated provider: the authorize URL, the code-for-token
//! exchange and the user-info lookup.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, Instrument};

use super::Provider;
use crate::config::ProviderConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Network or protocol failure talking to a provider. Never shown to the browser.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{stage} request failed: {source}")]
    Http { stage: &'static str, #[source] source: reqwest::Error },
    #[error("{stage} returned {status}: {body}")]
    Status { stage: &'static str, status: u16, body: String },
    #[error("{stage} response has no usable {field}")]
    MissingField { stage: &'static str, field: &'static str },
    #[error("{0} is not a federated provider")]
    NotFederated(Provider),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GoogleUser {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MicrosoftUser {
    #[serde(default)]
    user_principal_name: Option<String>,
    #[serde(default)]
    mail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
}

impl ProviderClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http })
    }

    /// The provider's consent page for this state and PKCE challenge.
    pub fn authorize_url(cfg: &ProviderConfig, state_id: &str, challenge: &str) -> String {
        let scope = cfg.scopes.join(" ");
        let params: [(&str, &str); 8] = [
            ("response_type", "code"),
            ("client_id", &cfg.client_id),
            ("redirect_uri", &cfg.redirect_url),
            ("scope", &scope),
            ("state", state_id),
            ("access_type", "online"),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let sep = if cfg.auth_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", cfg.auth_url, sep, query)
    }

    /// Trade an authorization code plus its PKCE verifier for an access token.
    pub async fn exchange_code(&self, cfg: &ProviderConfig, code: &str, verifier: &str) -> Result<String, ExchangeError> {
        const STAGE: &str = "token exchange";
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", cfg.redirect_url.as_str()),
            ("client_id", cfg.client_id.as_str()),
            ("client_secret", cfg.client_secret.as_str()),
            ("code_verifier", verifier),
        ];
        let span = tracing::info_span!("token_exchange", url = %cfg.token_url);
        let resp = self
            .http
            .post(&cfg.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .instrument(span)
            .await
            .map_err(|source| ExchangeError::Http { stage: STAGE, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::Status { stage: STAGE, status: status.as_u16(), body });
        }
        let tok: TokenResponse = resp.json().await.map_err(|source| ExchangeError::Http { stage: STAGE, source })?;
        if tok.access_token.is_empty() {
            return Err(ExchangeError::MissingField { stage: STAGE, field: "access_token" });
        }
        debug!(target: "oauth", "token: type={:?}, expires_in={:?}", tok.token_type, tok.expires_in);
        Ok(tok.access_token)
    }

    /// Ask the provider who the token belongs to, namespaced so usernames never collide across providers.
    pub async fn fetch_username(&self, provider: Provider, cfg: &ProviderConfig, access_token: &str) -> Result<String, ExchangeError> {
        const STAGE: &str = "user info";
        if !provider.is_federated() {
            return Err(ExchangeError::NotFederated(provider));
        }
        let span = tracing::info_span!("user_info", url = %cfg.userinfo_url);
        let resp = self
            .http
            .get(&cfg.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .instrument(span)
            .await
            .map_err(|source| ExchangeError::Http { stage: STAGE, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::Status { stage: STAGE, status: status.as_u16(), body });
        }
        match provider {
            Provider::Google => {
                let u: GoogleUser = resp.json().await.map_err(|source| ExchangeError::Http { stage: STAGE, source })?;
                u.email.filter(|e| !e.is_empty()).ok_or(ExchangeError::MissingField { stage: STAGE, field: "email" })
            }
            Provider::Microsoft => {
                let u: MicrosoftUser = resp.json().await.map_err(|source| ExchangeError::Http { stage: STAGE, source })?;
                let login = u
                    .user_principal_name
                    .filter(|s| !s.is_empty())
                    .or(u.mail.filter(|s| !s.is_empty()))
                    .ok_or(ExchangeError::MissingField { stage: STAGE, field: "userPrincipalName" })?;
                Ok(format!("{login}#microsoft"))
            }
            Provider::Local => Err(ExchangeError::NotFederated(provider)),
        }
    }
}
