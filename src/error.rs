//! Unified application error model and mapping helpers.
//! Handlers and middleware return `AppError`; module-level failures are typed
//! (`CredentialError`, `DbError`, ...) and converted here, which is where
//! internal detail is stripped before anything reaches the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::database::DbError;
use crate::identity::CredentialError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    NotFound { code: String, message: String },
    Auth { code: String, message: String },
    Forbidden { code: String, message: String },
    Unavailable { code: String, message: String, id: Option<String> },
    Internal { code: String, message: String, id: Option<String> },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::Unavailable { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::Unavailable { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    /// Correlation id for server-side faults; `None` for client errors.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            AppError::Unavailable { id, .. } | AppError::Internal { id, .. } => id.as_deref(),
            _ => None,
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn unavailable<S: Into<String>>(code: S, msg: S) -> Self { AppError::Unavailable { code: code.into(), message: msg.into(), id: None } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into(), id: None } }

    /// The generic "unauthenticated" error every credential failure collapses into.
    pub fn unauthenticated() -> Self { AppError::auth("unauthenticated", "unauthenticated") }

    /// Attach a correlation id to server-side faults. Client errors are returned unchanged.
    pub fn with_id(self, correlation: impl Into<String>) -> Self {
        match self {
            AppError::Unavailable { code, message, .. } => AppError::Unavailable { code, message, id: Some(correlation.into()) },
            AppError::Internal { code, message, .. } => AppError::Internal { code, message, id: Some(correlation.into()) },
            other => other,
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Auth { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::Unavailable { .. } => 503,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::error!(target: "error", "{} unhandled error: {:#}", id, err);
        AppError::internal("internal_error", "internal server error").with_id(id)
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        match err {
            // A bearer value without a resolver is a wiring bug, not a client problem.
            CredentialError::ResolverMissing { .. } => {
                let id = uuid::Uuid::new_v4().to_string();
                tracing::error!(target: "security", "{} {}", id, err);
                AppError::internal("internal_error", "internal server error").with_id(id)
            }
            other => {
                tracing::debug!(target: "security", "credential rejected: {}", other);
                AppError::unauthenticated()
            }
        }
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::error!(target: "database", "{} database failure: {}", id, err);
        AppError::unavailable("database_error", "database unavailable").with_id(id)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "status": "error",
            "code": self.code_str(),
            "message": self.message(),
            "id": self.correlation_id(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
        assert_eq!(AppError::auth("auth", "no").http_status(), 401);
        assert_eq!(AppError::forbidden("forbidden", "blocked").http_status(), 403);
        assert_eq!(AppError::unavailable("db", "down").http_status(), 503);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn credential_errors_never_leak_the_failed_check() {
        let a: AppError = CredentialError::BadSignature.into();
        let b: AppError = CredentialError::IssuerMismatch("evil".into()).into();
        assert_eq!(a, AppError::unauthenticated());
        assert_eq!(b, AppError::unauthenticated());
        assert!(!b.message().contains("evil"));
    }

    #[test]
    fn missing_resolver_is_a_server_fault() {
        let e: AppError = CredentialError::ResolverMissing { method: "GET".into(), uri: "/x".into() }.into();
        assert_eq!(e.http_status(), 500);
        assert!(e.correlation_id().is_some());
        assert!(!e.message().contains("/x"));
    }

    #[test]
    fn client_errors_ignore_correlation_ids() {
        let e = AppError::user("bad", "bad").with_id("abc");
        assert_eq!(e.correlation_id(), None);
        let e = AppError::internal("x", "y").with_id("abc");
        assert_eq!(e.correlation_id(), Some("abc"));
    }
}
