//! Signed, time-limited identity claims (HS256 JWT).
//!
//! Claims on the wire: `iss`, `sub` (username), `uid` (account id),
//! `exp` (absolute epoch **milliseconds**) and `roles`. Because `exp` is in
//! milliseconds the library's own seconds-based expiry check is switched off
//! and expiry is enforced here instead.

use chrono::{TimeDelta, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::principal::{Identity, UserContext};

/// Lifetime of a freshly issued credential.
pub const CREDENTIAL_TTL: TimeDelta = TimeDelta::hours(1);

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token is malformed: {0}")]
    Malformed(String),
    #[error("unexpected signing algorithm")]
    AlgorithmMismatch,
    #[error("token signature does not match")]
    BadSignature,
    #[error("unsupported issuer {0}")]
    IssuerMismatch(String),
    #[error("token claims are missing or of the wrong shape: {0}")]
    InvalidClaims(String),
    #[error("token expired")]
    Expired,
    #[error("unable to sign token: {0}")]
    Signing(String),
    #[error("a bearer credential was sent to {method} {uri} but no resolver is configured for it")]
    ResolverMissing { method: String, uri: String },
    #[error("bearer resolver rejected the credential: {0:#}")]
    Resolver(anyhow::Error),
}

/// Verifies a presented credential and turns it into an [`Identity`].
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, CredentialError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    sub: String,
    uid: String,
    exp: i64,
    roles: Vec<String>,
}

/// Issues and verifies credentials with a symmetric key.
#[derive(Clone)]
pub struct CredentialCodec {
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: TimeDelta,
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec").field("issuer", &self.issuer).field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl CredentialCodec {
    pub fn new(issuer: impl Into<String>, key: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            ttl: CREDENTIAL_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: TimeDelta) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn issuer(&self) -> &str { &self.issuer }

    pub fn issue<I, S>(&self, account_id: &str, username: &str, roles: I) -> Result<String, CredentialError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: username.to_string(),
            uid: account_id.to_string(),
            exp: (Utc::now() + self.ttl).timestamp_millis(),
            roles: roles.into_iter().map(Into::into).collect(),
        };
        encode(&Header::new(ALGORITHM), &claims, &self.encoding).map_err(|e| CredentialError::Signing(e.to_string()))
    }

    fn validation() -> Validation {
        // Only HS256 is accepted; exp is checked in milliseconds below.
        let mut v = Validation::new(ALGORITHM);
        v.validate_exp = false;
        v.validate_aud = false;
        v.required_spec_claims.clear();
        v
    }
}

impl CredentialVerifier for CredentialCodec {
    fn verify(&self, token: &str) -> Result<Identity, CredentialError> {
        let data = decode::<Claims>(token, &self.decoding, &Self::validation()).map_err(|e| match e.kind() {
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => CredentialError::AlgorithmMismatch,
            ErrorKind::InvalidSignature => CredentialError::BadSignature,
            ErrorKind::Json(inner) => CredentialError::InvalidClaims(inner.to_string()),
            _ => CredentialError::Malformed(e.to_string()),
        })?;
        let claims = data.claims;
        if claims.iss != self.issuer {
            return Err(CredentialError::IssuerMismatch(claims.iss));
        }
        if claims.exp <= Utc::now().timestamp_millis() {
            return Err(CredentialError::Expired);
        }
        // Context is reserved for identities produced by a bearer resolver.
        Ok(Identity::new(claims.sub, claims.uid, claims.exp, claims.roles).with_context(UserContext::new()))
    }
}
