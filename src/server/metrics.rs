//! Prometheus response metrics, recorded by `context_layer` and scraped at
//! `/metrics-prom`.
//!
//! `<prefix>_response_count{code, full_path_with_method}` counts every
//! response. `<prefix>_response_latency_histogram{full_path_with_method}`
//! observes the latency in milliseconds of successful ones.

use std::time::Duration;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use super::AppState;
use crate::error::AppError;

pub const METRICS_PATH: &str = "/metrics-prom";

/// Label used for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

pub struct HttpMetrics {
    registry: Registry,
    responses: IntCounterVec,
    latency: HistogramVec,
}

impl HttpMetrics {
    /// Fails when `prefix` does not make a valid metric name.
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let responses = IntCounterVec::new(
            Opts::new(format!("{prefix}_response_count"), "The total number of calls processed, regardless of status code"),
            &["code", "full_path_with_method"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(format!("{prefix}_response_latency_histogram"), "The response latency in ms of successful calls")
                .buckets(exponential_buckets(4.0, 2.0, 6)?),
            &["full_path_with_method"],
        )?;
        let registry = Registry::new();
        registry.register(Box::new(responses.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        Ok(Self { registry, responses, latency })
    }

    /// `route` is the method and matched route pattern, e.g. `GET /oauth/user`.
    pub fn observe(&self, route: &str, status: StatusCode, elapsed: Duration) {
        self.responses.with_label_values(&[status.as_str(), route]).inc();
        if status.is_success() {
            self.latency.with_label_values(&[route]).observe(elapsed.as_secs_f64() * 1000.0);
        }
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub(super) fn routes() -> Router<AppState> {
    Router::new().route(METRICS_PATH, get(scrape))
}

async fn scrape(State(state): State<AppState>) -> Response {
    let Some(metrics) = state.metrics.as_ref() else {
        return AppError::not_found("metrics_disabled", "metrics are not enabled").into_response();
    };
    match metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => AppError::from(anyhow::Error::new(e).context("rendering metrics")).into_response(),
    }
}
