//!
//! gatehouse HTTP server
//! ---------------------
//! Axum wiring for the sign-in surface and the request-scoped layers other
//! routes build on.
//!
//! Responsibilities:
//! - One `RequestContext` per request, with trace id and timing headers.
//! - Transactional and non-transactional database boundaries as route layers.
//! - Role guard middleware for protected routes.
//! - `/oauth/*` sign-in, callback, user and sign-out endpoints.
//! - `/ping` liveness and readiness.
//! - Per-route response metrics at `/metrics-prom`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{middleware, Router};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::database::postgres::PgDatabase;
use crate::database::{Database, TransactionManager};
use crate::identity::{BearerResolver, CredentialCodec, CredentialVerifier};
use crate::oauth::{AccountProvider, AuthorizationExchange, InMemoryAccounts, PgAccounts, ProviderClient};

pub mod layers;
pub mod metrics;
mod oauth_routes;
mod ping;

pub use layers::{context_layer, non_tx_layer, panic_layer, require_role, tx_layer, Ctx, RequiredRoles};
pub use metrics::HttpMetrics;

/// Shared server state injected into handlers and layers.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<dyn CredentialVerifier>,
    pub resolver: Option<Arc<dyn BearerResolver>>,
    pub tx: Option<TransactionManager>,
    pub exchange: Arc<AuthorizationExchange>,
    pub build_number: String,
    pub metrics: Option<Arc<HttpMetrics>>,
    pub started: Instant,
}

impl AppState {
    pub fn new(verifier: Arc<dyn CredentialVerifier>, exchange: Arc<AuthorizationExchange>) -> Self {
        Self {
            verifier,
            resolver: None,
            tx: None,
            exchange,
            build_number: "dev".to_string(),
            metrics: None,
            started: Instant::now(),
        }
    }

    pub fn with_database(mut self, db: Arc<dyn Database>) -> Self {
        self.tx = Some(TransactionManager::new(db));
        self
    }

    /// Resolver for `Authorization` header values on every request.
    pub fn with_resolver(mut self, resolver: Arc<dyn BearerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_metrics(mut self, metrics: HttpMetrics) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    pub fn with_build_number(mut self, build_number: impl Into<String>) -> Self {
        self.build_number = build_number.into();
        self
    }

    /// Wire everything `config` asks for. Fails on anything that would break the first sign-in.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let codec = Arc::new(CredentialCodec::new(config.jwt_issuer.clone(), config.jwt_key.as_bytes()));

        let mut database: Option<Arc<dyn Database>> = None;
        let accounts: Arc<dyn AccountProvider> = match (&config.database_url, &config.accounts_file) {
            (Some(url), _) => {
                let db = PgDatabase::new(url, config.db_pool_size).context("GATEHOUSE_DB_URL is not a valid postgres url")?;
                database = Some(Arc::new(db));
                Arc::new(PgAccounts)
            }
            (None, Some(path)) => Arc::new(InMemoryAccounts::from_json_file(path)?),
            (None, None) => {
                warn!(target: "startup", "no database and no accounts file configured; every sign-in will go to registration");
                Arc::new(InMemoryAccounts::default())
            }
        };

        let mut exchange = AuthorizationExchange::new(codec.clone(), accounts, ProviderClient::new()?, config.cookies.clone())
            .with_local_sign_in(config.local_sign_in);
        for (provider, cfg) in &config.providers {
            exchange = exchange.with_provider(*provider, cfg.clone());
        }

        let metrics = HttpMetrics::new(&config.metrics_prefix)
            .with_context(|| format!("GATEHOUSE_METRICS_PREFIX '{}' is not a valid metric name prefix", config.metrics_prefix))?;
        let mut state = AppState::new(codec, Arc::new(exchange))
            .with_build_number(config.build_number.clone())
            .with_metrics(metrics);
        if let Some(db) = database {
            state = state.with_database(db);
        }
        Ok(state)
    }
}

/// The application router.
pub fn router(state: AppState) -> Router {
    router_with(state, Router::new())
}

/// The application router plus `extra` routes, which get the same per-request layers.
pub fn router_with(state: AppState, extra: Router<AppState>) -> Router {
    Router::new()
        .nest("/oauth", oauth_routes::routes(&state))
        .merge(extra)
        .merge(ping::routes())
        .merge(metrics::routes())
        .layer(middleware::from_fn(panic_layer))
        .layer(middleware::from_fn_with_state(state.clone(), context_layer))
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, app: Router) -> anyhow::Result<()> {
    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the HTTP server on the configured port.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;
    let enabled: Vec<&str> = config.providers.keys().map(|p| p.name()).collect();
    info!(target: "startup", "providers={:?}, local_sign_in={}, database={}",
        enabled, config.local_sign_in, state.tx.is_some());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, router(state)).await
}
