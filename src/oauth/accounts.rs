//! Account lookup, the one collaborator the sign-in flow reads from.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::postgres::PgConnection;
use crate::identity::RequestContext;

/// A registered account. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    /// `google`, `microsoft` or `own`.
    pub provider: String,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AccountLookupError {
    #[error("account not found")]
    NotFound,
    #[error("account lookup failed: {0:#}")]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn find(&self, ctx: &RequestContext, username: &str) -> Result<Account, AccountLookupError>;
}

/// Accounts held in memory, typically loaded from a JSON array at startup.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccounts {
    by_username: HashMap<String, Account>,
}

impl InMemoryAccounts {
    pub fn new<I: IntoIterator<Item = Account>>(accounts: I) -> Self {
        Self { by_username: accounts.into_iter().map(|a| (a.username.clone(), a)).collect() }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading accounts from {}", path.display()))?;
        let accounts: Vec<Account> = serde_json::from_str(&text).with_context(|| format!("parsing accounts in {}", path.display()))?;
        Ok(Self::new(accounts))
    }

    pub fn len(&self) -> usize { self.by_username.len() }

    pub fn is_empty(&self) -> bool { self.by_username.is_empty() }
}

#[async_trait]
impl AccountProvider for InMemoryAccounts {
    async fn find(&self, _ctx: &RequestContext, username: &str) -> Result<Account, AccountLookupError> {
        self.by_username.get(username).cloned().ok_or(AccountLookupError::NotFound)
    }
}

/// Accounts in a Postgres `accounts` table, read through the request's connection.
///
/// ```sql
/// CREATE TABLE accounts (
///     id            TEXT PRIMARY KEY,
///     username      TEXT NOT NULL UNIQUE,
///     provider      TEXT NOT NULL,
///     password_hash TEXT NOT NULL DEFAULT '',
///     roles         TEXT[] NOT NULL DEFAULT '{}'
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct PgAccounts;

const FIND_ACCOUNT_SQL: &str =
    "SELECT id::text, username, provider, password_hash, roles FROM accounts WHERE username = $1";

#[async_trait]
impl AccountProvider for PgAccounts {
    async fn find(&self, ctx: &RequestContext, username: &str) -> Result<Account, AccountLookupError> {
        let handle = ctx.transactional_handle();
        let conn = handle
            .downcast_ref::<PgConnection>()
            .ok_or_else(|| anyhow::anyhow!("request connection is not a postgres connection"))?;
        let row = conn
            .client()
            .query_opt(FIND_ACCOUNT_SQL, &[&username])
            .await
            .context("selecting account")?
            .ok_or(AccountLookupError::NotFound)?;
        Ok(Account {
            id: row.try_get(0).context("accounts.id")?,
            username: row.try_get(1).context("accounts.username")?,
            provider: row.try_get(2).context("accounts.provider")?,
            password_hash: row.try_get(3).context("accounts.password_hash")?,
            roles: row.try_get(4).context("accounts.roles")?,
        })
    }
}
