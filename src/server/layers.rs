//! Request-scoped middleware: context/timing, panic containment, database
//! boundaries and the role guard.
//!
//! Outer to inner: `context_layer` -> `panic_layer` -> route layers
//! (`tx_layer` / `non_tx_layer`, `require_role`) -> handler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequestParts, MatchedPath, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt; // for catch_unwind on async blocks
use tracing::{error, Instrument};

use super::metrics::UNMATCHED_ROUTE;
use super::AppState;
use crate::database::TxError;
use crate::error::AppError;
use crate::identity::RequestContext;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const TIME_HEADER: &str = "x-time";

/// Extractor for the request's context. Requires `context_layer`.
#[derive(Clone)]
pub struct Ctx(pub Arc<RequestContext>);

impl<S: Send + Sync> FromRequestParts<S> for Ctx {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<RequestContext>>()
            .cloned()
            .map(Ctx)
            .ok_or_else(|| {
                error!(target: "server", "route reached without a request context; is context_layer installed?");
                AppError::internal("context_missing", "internal server error")
            })
    }
}

fn context_of(req: &mut Request, state: &AppState) -> Arc<RequestContext> {
    RequestContext::attach(req, state.verifier.clone(), state.resolver.clone())
}

/// Attach the request context, run everything inside its span, stamp
/// `x-trace-id` and `x-time` (milliseconds) onto the response and record
/// response metrics under the matched route.
pub async fn context_layer(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let start = Instant::now();
    let ctx = context_of(&mut req, &state);
    let route = format!(
        "{} {}",
        req.method(),
        req.extensions().get::<MatchedPath>().map(MatchedPath::as_str).unwrap_or(UNMATCHED_ROUTE)
    );
    ctx.debug(format_args!("timer starting '{} {}'", req.method(), req.uri()));

    let mut resp = next.run(req).instrument(ctx.span().clone()).await;

    let elapsed = start.elapsed();
    ctx.debug(format_args!("timer ended with status {} after {:?}", resp.status().as_u16(), elapsed));
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(ctx.trace_id()) {
        headers.insert(TRACE_ID_HEADER, v);
    }
    headers.insert(TIME_HEADER, HeaderValue::from(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)));
    if let Some(metrics) = state.metrics.as_ref() {
        metrics.observe(&route, resp.status(), elapsed);
    }
    resp
}

/// Turn a panic anywhere below into a 500 carrying a correlation id. Transaction
/// boundaries below have already rolled back by the time the panic arrives here.
pub async fn panic_layer(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(resp) => resp,
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() { *s }
                      else if let Some(s) = panic_payload.downcast_ref::<String>() { s.as_str() }
                      else { "panic" };
            let id = uuid::Uuid::new_v4().to_string();
            error!(target: "panic", "{} HTTP handler panic: {}", id, msg);
            AppError::internal("internal_panic", "internal server error").with_id(id).into_response()
        }
    }
}

/// Run the rest of the request in a database transaction. Server errors roll back; everything else commits
/// unless the handler marked the context rollback-only.
pub async fn tx_layer(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let ctx = context_of(&mut req, &state);
    let Some(tx) = state.tx.as_ref() else {
        ctx.error(format_args!("transactional route called but no database is configured"));
        return AppError::unavailable("database_unavailable", "database unavailable").into_response();
    };
    let result = tx
        .run_in_transaction(&ctx, || async move {
            let resp = next.run(req).await;
            if resp.status().is_server_error() { Err(resp) } else { Ok(resp) }
        })
        .await;
    match result {
        Ok(resp) | Err(TxError::Body(resp)) => resp,
        Err(TxError::Begin(e)) => AppError::from(e).into_response(),
        Err(TxError::Commit { source, .. }) => {
            // the handler's response claims success for work that was not saved
            AppError::from(source).into_response()
        }
    }
}

/// Install an autocommit connection for the rest of the request. Without a
/// configured database this is a pass-through.
pub async fn non_tx_layer(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let ctx = context_of(&mut req, &state);
    if let Some(tx) = state.tx.as_ref() {
        if let Err(e) = tx.non_transactional(&ctx).await {
            return AppError::from(e).into_response();
        }
    }
    next.run(req).await
}

/// Roles accepted by a [`require_role`] layer.
#[derive(Debug, Clone)]
pub struct RequiredRoles(Arc<[String]>);

impl RequiredRoles {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(roles.into_iter().map(Into::into).collect())
    }
}

/// `middleware::from_fn_with_state(RequiredRoles::new(["admin"]), require_role)`.
///
/// 401 for anonymous callers and rejected credentials, 403 for a signed-in
/// caller without any of the roles, 500 for a bearer credential nobody can resolve.
pub async fn require_role(State(roles): State<RequiredRoles>, req: Request, next: Next) -> Response {
    let Some(ctx) = req.extensions().get::<Arc<RequestContext>>().cloned() else {
        error!(target: "security", "role guard reached without a request context; is context_layer installed?");
        return AppError::internal("context_missing", "internal server error").into_response();
    };
    match ctx.user_has_role(&roles.0[..]).await {
        Ok(true) => next.run(req).await,
        Ok(false) => match ctx.get_user().await {
            Ok(user) if user.is_anonymous() => AppError::unauthenticated().into_response(),
            Ok(user) => {
                ctx.info(format_args!("{} lacks any of {:?}", user.username, roles.0));
                AppError::forbidden("forbidden", "missing role").into_response()
            }
            Err(e) => AppError::from(e).into_response(),
        },
        Err(e) => AppError::from(e).into_response(),
    }
}
