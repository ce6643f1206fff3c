use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::layers::Ctx;
use super::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new().route("/ping", get(ping))
}

/// Liveness and readiness. Always 200; a failing database shows up as `live: "nok"`.
async fn ping(State(state): State<AppState>, Ctx(ctx): Ctx) -> Json<Value> {
    let uptime = state.started.elapsed();
    let mut resp = json!({
        "service": "ok",
        "database": "ok",
        "build-number": state.build_number,
        "live": "ok",
        "ready": "ok",
        "uptime": format!("{:.3}s", uptime.as_secs_f64()),
    });

    match state.tx.as_ref() {
        None => resp["database"] = json!("not configured"),
        Some(tx) => {
            if let Err(e) = tx.database().ping().await {
                ctx.warn(format_args!("ping: database check failed: {}", e));
                resp["database"] = json!(e.to_string());
                resp["live"] = json!("nok");
            }
        }
    }

    if ctx.query_param_as_bool_or("extra", false) {
        resp["version"] = json!(env!("CARGO_PKG_VERSION"));
        resp["os"] = json!(std::env::consts::OS);
        resp["arch"] = json!(std::env::consts::ARCH);
        resp["cpus"] = json!(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
    }

    Json(resp)
}
