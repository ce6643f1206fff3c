use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

use gatehouse::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    // Configuration faults stop the process before anything binds
    let config = AppConfig::from_env()?;

    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "gatehouse",
        "gatehouse starting: RUST_LOG='{}', http_port={}, build={}, database={}, accounts_file={:?}",
        rust_log, config.http_port, config.build_number, config.database_url.is_some(), config.accounts_file
    );

    gatehouse::server::run(config).await
}
