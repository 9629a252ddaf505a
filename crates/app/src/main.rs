mod auth;
mod boxes;
mod calendar;
mod campaigns;
mod deliveries;
mod hub;
mod incidents;
mod maintenance;
mod notifications;
mod organization;
mod problem;
mod qr;
mod reports;
mod router;
mod supervisor;
mod telemetry;
mod workers;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;

use chrono::Utc;
use tracing::{info, warn};

use safebox_storage::Database;
use safebox_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    if let Some(bootstrap) = &config.bootstrap_user {
        let branch = database
            .branches()
            .list(Some(true))
            .await?
            .into_iter()
            .next()
            .map(|summary| summary.entry.code);
        match branch {
            Some(branch) => {
                auth::ensure_bootstrap_user(&database, bootstrap, &branch, Utc::now()).await?;
            }
            None => warn!(stage = "auth", "no active branch, bootstrap account skipped"),
        }
    }

    maintenance::MaintenanceWorker::new(database.clone(), config.maintenance_interval).spawn();

    let tokens = auth::TokenKeys::new(&config.jwt_secret, config.token_ttl);
    let state = router::AppState::new(metrics, database, tokens, config.timezone);

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        timezone = %config.timezone,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
