//! Process configuration read from `GATEHOUSE_*` environment variables.
//!
//! Everything the service cannot run without is validated here, once, at
//! startup: a missing signing key or a half-configured provider fails
//! `from_env` and the process never binds its listener.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::database::postgres::DEFAULT_POOL_SIZE;
use crate::oauth::Provider;

pub const ENV_PREFIX: &str = "GATEHOUSE";

/// Endpoint and client settings for one federated identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub domain: Option<String>,
    pub secure: bool,
}

impl Default for CookieSettings {
    fn default() -> Self { Self { domain: None, secure: true } }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_port: u16,
    pub database_url: Option<String>,
    pub db_pool_size: usize,
    pub accounts_file: Option<String>,
    pub jwt_issuer: String,
    pub jwt_key: String,
    pub cookies: CookieSettings,
    pub providers: HashMap<Provider, ProviderConfig>,
    pub local_sign_in: bool,
    pub build_number: String,
    /// Name prefix of the exported response metrics.
    pub metrics_prefix: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| -> Option<String> {
            lookup(&format!("{ENV_PREFIX}_{suffix}")).filter(|v| !v.trim().is_empty())
        };
        let require = |suffix: &str| -> Result<String> {
            get(suffix).ok_or_else(|| anyhow!("please set env var {ENV_PREFIX}_{suffix}"))
        };

        let http_port = match get("HTTP_PORT") {
            Some(p) => p.parse::<u16>().with_context(|| format!("invalid {ENV_PREFIX}_HTTP_PORT '{p}'"))?,
            None => 8080,
        };

        let db_pool_size = match get("DB_POOL_SIZE") {
            Some(n) => match n.parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => bail!("invalid {ENV_PREFIX}_DB_POOL_SIZE '{n}'"),
            },
            None => DEFAULT_POOL_SIZE,
        };

        let jwt_issuer = require("JWT_ISSUER")?;
        let jwt_key = require("JWT_KEY")?;

        let secure = match get("USE_SECURE_COOKIES") {
            Some(v) => parse_bool(&v).with_context(|| format!("{ENV_PREFIX}_USE_SECURE_COOKIES must be true or false"))?,
            None => true,
        };
        let cookies = CookieSettings { domain: get("COOKIE_DOMAIN"), secure };

        let mut providers = HashMap::new();
        for provider in [Provider::Google, Provider::Microsoft] {
            let slug = provider.slug().to_ascii_uppercase();
            let enabled = match get(&format!("OAUTH_{slug}_ENABLED")) {
                Some(v) => parse_bool(&v).with_context(|| format!("{ENV_PREFIX}_OAUTH_{slug}_ENABLED must be true or false"))?,
                None => false,
            };
            if !enabled { continue; }
            let cfg = ProviderConfig {
                client_id: require(&format!("OAUTH_{slug}_CLIENT_ID"))?,
                client_secret: require(&format!("OAUTH_{slug}_CLIENT_SECRET"))?,
                redirect_url: require(&format!("OAUTH_{slug}_REDIRECT_URL"))?,
                auth_url: require(&format!("OAUTH_{slug}_AUTH_URL"))?,
                token_url: require(&format!("OAUTH_{slug}_TOKEN_URL"))?,
                userinfo_url: require(&format!("OAUTH_{slug}_USERINFO_URL"))?,
                scopes: provider.default_scopes(),
            };
            debug!(target: "config", "{} oauth: redirect={}, auth={}, token={}, userinfo={}",
                provider.name(), cfg.redirect_url, cfg.auth_url, cfg.token_url, cfg.userinfo_url);
            providers.insert(provider, cfg);
        }

        let local_sign_in = match get("OAUTH_O_ENABLED") {
            Some(v) => parse_bool(&v).with_context(|| format!("{ENV_PREFIX}_OAUTH_O_ENABLED must be true or false"))?,
            None => false,
        };

        let cfg = AppConfig {
            http_port,
            database_url: get("DB_URL"),
            db_pool_size,
            accounts_file: get("ACCOUNTS_FILE"),
            jwt_issuer,
            jwt_key,
            cookies,
            providers,
            local_sign_in,
            build_number: get("BUILD_NUMBER").unwrap_or_else(|| "dev".to_string()),
            metrics_prefix: get("METRICS_PREFIX").unwrap_or_else(|| "gatehouse".to_string()),
        };
        debug!(target: "config", "jwt issuer={}, key=<hidden>, secure_cookies={}, cookie_domain={:?}",
            cfg.jwt_issuer, cfg.cookies.secure, cfg.cookies.domain);
        Ok(cfg)
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Ok(true),
        "0" | "f" | "false" | "no" => Ok(false),
        other => bail!("not a boolean: '{other}'"),
    }
}
