//! Authorization-code sign-in with PKCE against federated identity providers,
//! plus an optional local username/password path.
//!
//! [`AuthorizationExchange`] is the only component that mints credentials.

mod accounts;
mod exchange;
mod pkce;
mod provider;
mod state;

pub use accounts::{Account, AccountLookupError, AccountProvider, InMemoryAccounts, PgAccounts};
pub use exchange::{
    clear_token_cookie, token_cookie, AuthorizationExchange, CallbackOutcome, ExchangeError, FlowStage, SignInRequest,
    LOCAL_CALLBACK_PATH,
};
pub use pkce::{challenge_s256, generate_verifier};
pub use provider::ProviderClient;
pub use state::{AuthState, StateStore, STATE_TTL};

use std::fmt;

/// Where an account signs in. The wire name is what [`Account::provider`] stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Google,
    Microsoft,
    Local,
}

impl Provider {
    /// Path segment used in routes (`/oauth/sign-in/g`, `/oauth/g/redirect`) and env var names.
    pub fn slug(&self) -> &'static str {
        match self {
            Provider::Google => "g",
            Provider::Microsoft => "m",
            Provider::Local => "o",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Microsoft => "microsoft",
            Provider::Local => "own",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "g" => Some(Provider::Google),
            "m" => Some(Provider::Microsoft),
            "o" => Some(Provider::Local),
            _ => None,
        }
    }

    pub fn default_scopes(&self) -> Vec<String> {
        match self {
            Provider::Google => vec!["email".into()],
            Provider::Microsoft => vec!["openid".into(), "email".into(), "User.Read".into()],
            Provider::Local => Vec::new(),
        }
    }

    pub fn is_federated(&self) -> bool { !matches!(self, Provider::Local) }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
