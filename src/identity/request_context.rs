//! Per-request context: the active database handle, the rollback-only flag and
//! the lazily resolved identity of the caller.
//!
//! One instance exists per inbound request (or per background job). It is
//! shared behind an `Arc` only so that axum can move it between extractors;
//! it is never used by more than one request.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{header, HeaderMap, Method, Request, Uri};
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::Span;

use super::authorizer::user_has_a_role;
use super::codec::{CredentialError, CredentialVerifier};
use super::principal::{Identity, UserContext};
use crate::database::{Connection, TransactionHandle};
use crate::error::AppError;

/// Name of the cookie carrying the signed credential.
pub const TOKEN_COOKIE_NAME: &str = "token";

/// Lifetime given to identities produced by a [`BearerResolver`], regardless of
/// what the external credential itself claims.
pub const RESOLVED_IDENTITY_TTL: TimeDelta = TimeDelta::minutes(5);

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// What a [`BearerResolver`] knows about the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPrincipal {
    pub user_context: UserContext,
    pub user_id: String,
    pub username: String,
    pub roles: Vec<String>,
}

/// Maps a raw `Authorization` header value (service-to-service credentials) to a principal.
#[async_trait]
pub trait BearerResolver: Send + Sync {
    async fn resolve(&self, ctx: &RequestContext, bearer: &str) -> anyhow::Result<ResolvedPrincipal>;
}

#[async_trait]
impl<F> BearerResolver for F
where
    F: Fn(&RequestContext, &str) -> anyhow::Result<ResolvedPrincipal> + Send + Sync,
{
    async fn resolve(&self, ctx: &RequestContext, bearer: &str) -> anyhow::Result<ResolvedPrincipal> {
        self(ctx, bearer)
    }
}

struct HttpOrigin {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    verifier: Arc<dyn CredentialVerifier>,
}

enum Origin {
    Http(HttpOrigin),
    Background,
}

#[derive(Default)]
struct Slot {
    handle: Option<TransactionHandle>,
    rollback_only: bool,
}

/// Slot contents set aside while a nested transaction boundary is active.
pub(crate) struct SavedSlot(Slot);

pub struct RequestContext {
    id: u64,
    trace_id: String,
    span: Span,
    origin: Origin,
    resolver: OnceLock<Arc<dyn BearerResolver>>,
    slot: Mutex<Slot>,
    user: OnceCell<Identity>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("trace_id", &self.trace_id)
            .field("background", &matches!(self.origin, Origin::Background))
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Context for an inbound HTTP request. Credentials are read from `req`'s headers.
    pub fn from_request<B>(req: &Request<B>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let trace_id = trace_id_from_headers(req.headers()).unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let span = tracing::info_span!("request", id, trace_id = %trace_id, method = %req.method(), path = %req.uri().path());
        Self {
            id,
            trace_id,
            span,
            origin: Origin::Http(HttpOrigin {
                method: req.method().clone(),
                uri: req.uri().clone(),
                headers: req.headers().clone(),
                verifier,
            }),
            resolver: OnceLock::new(),
            slot: Mutex::new(Slot::default()),
            user: OnceCell::new(),
        }
    }

    /// Context for work that does not originate from HTTP (timers, jobs) running as a fixed user.
    /// Transport helpers on such a context panic.
    pub fn background<I, S>(username: &str, user_id: &str, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let trace_id = uuid::Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!("background", id, trace_id = %trace_id, user = %username);
        Self {
            id,
            trace_id,
            span,
            origin: Origin::Background,
            resolver: OnceLock::new(),
            slot: Mutex::new(Slot::default()),
            user: OnceCell::new_with(Some(Identity::new(username, user_id, 0, roles))),
        }
    }

    /// Return the context already attached to `req`, or create and attach one.
    /// A resolver is only installed if the context does not have one yet.
    pub fn attach<B>(
        req: &mut Request<B>,
        verifier: Arc<dyn CredentialVerifier>,
        resolver: Option<Arc<dyn BearerResolver>>,
    ) -> Arc<RequestContext> {
        let ctx = match req.extensions().get::<Arc<RequestContext>>() {
            Some(existing) => existing.clone(),
            None => {
                let ctx = Arc::new(RequestContext::from_request(req, verifier));
                req.extensions_mut().insert(ctx.clone());
                ctx
            }
        };
        if let Some(r) = resolver {
            ctx.set_resolver_if_unset(r);
        }
        ctx
    }

    pub fn id(&self) -> u64 { self.id }

    pub fn trace_id(&self) -> &str { &self.trace_id }

    pub fn span(&self) -> &Span { &self.span }


    pub fn set_resolver_if_unset(&self, resolver: Arc<dyn BearerResolver>) {
        let _ = self.resolver.set(resolver);
    }

    // ---------------------------------------------------------------------
    // transactional handle
    // ---------------------------------------------------------------------

    pub fn set_transactional_handle(&self, conn: Arc<dyn Connection>, is_transactional: bool) {
        self.slot.lock().handle = Some(TransactionHandle::new(conn, is_transactional));
    }

    /// The handle installed by a transactional or non-transactional boundary.
    ///
    /// # Panics
    /// When no boundary installed one; the route is missing its database layer.
    pub fn transactional_handle(&self) -> TransactionHandle {
        match self.slot.lock().handle.clone() {
            Some(h) => h,
            None => panic!("no database handle in request context {}: route the call through the tx or non-tx layer, or use TransactionManager", self.id),
        }
    }

    pub fn has_transactional_handle(&self) -> bool {
        self.slot.lock().handle.is_some()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.slot.lock().rollback_only
    }

    /// Force the active transaction to roll back at its boundary. Does nothing without a handle.
    ///
    /// # Panics
    /// When the installed handle is not transactional, since there is nothing to roll back.
    pub fn mark_rollback_only(&self) {
        let mut slot = self.slot.lock();
        let Some(handle) = slot.handle.as_ref() else { return; };
        if !handle.is_transactional() {
            drop(slot);
            panic!("unable to roll back a non-transactional database connection: use the tx layer for this route or TransactionManager::run_in_transaction");
        }
        slot.rollback_only = true;
    }

    pub(crate) fn swap_slot(&self, handle: Option<TransactionHandle>) -> SavedSlot {
        let mut slot = self.slot.lock();
        SavedSlot(std::mem::replace(&mut *slot, Slot { handle, rollback_only: false }))
    }

    pub(crate) fn restore_slot(&self, saved: SavedSlot) {
        *self.slot.lock() = saved.0;
    }

    // ---------------------------------------------------------------------
    // identity
    // ---------------------------------------------------------------------

    /// The caller's identity, resolved on first use and cached for the rest of the request.
    /// Failures are not cached.
    pub async fn get_user(&self) -> Result<Identity, CredentialError> {
        self.user.get_or_try_init(|| self.resolve_user()).await.cloned()
    }

    pub async fn user_has_role<S: AsRef<str>>(&self, allowed: &[S]) -> Result<bool, CredentialError> {
        let user = self.get_user().await?;
        Ok(user_has_a_role(allowed, &user))
    }

    async fn resolve_user(&self) -> Result<Identity, CredentialError> {
        let Origin::Http(http) = &self.origin else {
            // background contexts are created with their identity already set
            return Ok(Identity::anonymous());
        };

        if let Some(token) = parse_cookie(&http.headers, TOKEN_COOKIE_NAME).filter(|t| !t.is_empty()) {
            return http.verifier.verify(&token);
        }

        let bearer = match http.headers.get(header::AUTHORIZATION) {
            None => None,
            Some(v) => match v.to_str() {
                Ok(s) if !s.trim().is_empty() => Some(s),
                Ok(_) => None,
                Err(_) => return Err(CredentialError::Malformed("authorization header is not visible ascii".into())),
            },
        };
        let Some(bearer) = bearer else {
            return Ok(Identity::anonymous());
        };

        let Some(resolver) = self.resolver.get() else {
            return Err(CredentialError::ResolverMissing { method: http.method.to_string(), uri: http.uri.to_string() });
        };
        let p = resolver.resolve(self, bearer).await.map_err(CredentialError::Resolver)?;
        let expires = (Utc::now() + RESOLVED_IDENTITY_TTL).timestamp_millis();
        Ok(Identity::new(p.username, p.user_id, expires, p.roles).with_context(p.user_context))
    }

    // ---------------------------------------------------------------------
    // transport helpers
    // ---------------------------------------------------------------------

    fn http(&self, what: &str) -> &HttpOrigin {
        match &self.origin {
            Origin::Http(h) => h,
            Origin::Background => panic!("{what} is not supported on a background context"),
        }
    }

    pub fn method(&self) -> &Method { &self.http("method").method }

    pub fn uri(&self) -> &Uri { &self.http("uri").uri }

    pub fn headers(&self) -> &HeaderMap { &self.http("headers").headers }

    fn query_params(&self, what: &str) -> HashMap<String, String> {
        Query::<HashMap<String, String>>::try_from_uri(&self.http(what).uri)
            .map(|q| q.0)
            .unwrap_or_default()
    }

    /// Unknown and empty parameters both read as "".
    pub fn query_param_as_string(&self, name: &str) -> String {
        self.query_params("query_param_as_string").remove(name).unwrap_or_default()
    }

    pub fn query_param_as_int(&self, name: &str) -> Result<i32, std::num::ParseIntError> {
        self.query_params("query_param_as_int").remove(name).unwrap_or_default().parse::<i32>()
    }

    /// `default` when absent; unparseable values read as false.
    pub fn query_param_as_bool_or(&self, name: &str, default: bool) -> bool {
        match self.query_params("query_param_as_bool_or").remove(name) {
            None => default,
            Some(v) => v.parse::<bool>().unwrap_or(false),
        }
    }

    pub fn decode_json_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, serde_json::Error> {
        self.http("decode_json_body");
        // bodies carry credentials on sign-in routes; only the size is logged
        self.debug(format_args!("got body of {} bytes", body.len()));
        serde_json::from_slice(body)
    }

    // ---------------------------------------------------------------------
    // logging / tracing
    // ---------------------------------------------------------------------

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(parent: &self.span, trace_id = %self.trace_id, "{}", args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(parent: &self.span, trace_id = %self.trace_id, "{}", args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(parent: &self.span, trace_id = %self.trace_id, "{}", args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(parent: &self.span, trace_id = %self.trace_id, "{}", args);
    }

    /// A child span of this request; `remote` marks outbound calls.
    pub fn start_span(&self, name: &str, remote: bool) -> Span {
        let kind = if remote { "client" } else { "internal" };
        tracing::info_span!(parent: &self.span, "span", name = %name, kind = kind, trace_id = %self.trace_id)
    }

    /// Log `err` under a fresh correlation id, roll back any active transaction and return a
    /// generic error that carries only the id.
    pub fn handle_error(&self, err: &dyn fmt::Display, msg: &str) -> AppError {
        let id = uuid::Uuid::new_v4().to_string();
        let transactional = self.slot.lock().handle.as_ref().is_some_and(|h| h.is_transactional());
        if transactional {
            self.mark_rollback_only();
        }
        self.warn(format_args!("{} {}: {}", id, msg, err));
        AppError::internal("request_failed", msg).with_id(id)
    }
}

/// Read a cookie value from every `Cookie` header in `headers`.
pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all(header::COOKIE) {
        let Ok(s) = cookie.to_str() else { continue; };
        for part in s.split(';') {
            let p = part.trim();
            if let Some(eq) = p.find('=') {
                let (k, v) = p.split_at(eq);
                if k == name { return Some(v[1..].to_string()); }
            }
        }
    }
    None
}

/// Trace id from a W3C `traceparent` header (`00-<trace id>-<span id>-<flags>`).
fn trace_id_from_headers(headers: &HeaderMap) -> Option<String> {
    let tp = headers.get("traceparent")?.to_str().ok()?;
    let mut parts = tp.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    let valid = trace_id.len() == 32
        && trace_id.chars().all(|c| c.is_ascii_hexdigit())
        && trace_id.chars().any(|c| c != '0');
    valid.then(|| trace_id.to_ascii_lowercase())
}
