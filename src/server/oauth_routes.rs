//! `/oauth/*` endpoints. Only enabled providers get routes.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::middleware;
use axum::response::{AppendHeaders, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::layers::{non_tx_layer, Ctx};
use super::AppState;
use crate::error::AppError;
use crate::oauth::{CallbackOutcome, Provider, SignInRequest};

pub(super) fn routes(state: &AppState) -> Router<AppState> {
    let mut router = Router::new();
    let mut sign_in_routes = false;
    for p in [Provider::Google, Provider::Microsoft] {
        if !state.exchange.is_enabled(p) { continue; }
        sign_in_routes = true;
        router = router
            .route(&format!("/sign-in/{}", p.slug()), get(move |s: State<AppState>, c: Ctx| sign_in(s, c, p)))
            .route(&format!("/{}/redirect", p.slug()), get(move |s: State<AppState>, c: Ctx| callback(s, c, p)));
    }
    if state.exchange.is_enabled(Provider::Local) {
        sign_in_routes = true;
        // POST as well: a browser fetch follows the 307 from sign-in with the same method
        router = router
            .route("/sign-in/o", post(sign_in_local))
            .route(
                "/o/redirect",
                get(|s: State<AppState>, c: Ctx| callback(s, c, Provider::Local))
                    .post(|s: State<AppState>, c: Ctx| callback(s, c, Provider::Local)),
            );
    }
    // account lookups need a connection; the identity and sign-out routes do not.
    // route_layer panics on a router without routes.
    if sign_in_routes {
        router = router.route_layer(middleware::from_fn_with_state(state.clone(), non_tx_layer));
    }
    router
        .route("/user", get(current_user))
        .route("/sign-out", get(sign_out))
}

async fn sign_in(State(state): State<AppState>, Ctx(ctx): Ctx, provider: Provider) -> Response {
    let target = ctx.query_param_as_string("targetUrl");
    match state.exchange.begin_sign_in(&ctx, provider, &target) {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn sign_in_local(State(state): State<AppState>, Ctx(ctx): Ctx, body: Bytes) -> Response {
    let req: SignInRequest = match ctx.decode_json_body(&body) {
        Ok(r) => r,
        Err(e) => {
            ctx.debug(format_args!("unreadable sign-in body: {}", e));
            return AppError::user("sign_in_failed", "sign in failed").into_response();
        }
    };
    match state.exchange.begin_sign_in_local(&ctx, &req).await {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn callback(State(state): State<AppState>, Ctx(ctx): Ctx, provider: Provider) -> Response {
    let state_id = ctx.query_param_as_string("state");
    let code = ctx.query_param_as_string("code");
    match state.exchange.handle_callback(&ctx, provider, &state_id, &code).await {
        Ok(CallbackOutcome::Issued { cookie, location }) => {
            (AppendHeaders([(SET_COOKIE, cookie)]), Redirect::temporary(&location)).into_response()
        }
        Ok(CallbackOutcome::Register { location }) => Redirect::temporary(&location).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn current_user(Ctx(ctx): Ctx) -> Response {
    match ctx.get_user().await {
        Ok(user) => Json(user).into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

async fn sign_out(State(state): State<AppState>) -> Response {
    (AppendHeaders([(SET_COOKIE, state.exchange.sign_out())]), Redirect::temporary("/")).into_response()
}
