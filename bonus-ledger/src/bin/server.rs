//! Bonus ledger server binary
//!
//! Opens storage, starts the reconciliation loop and waits for Ctrl-C.

use anyhow::Context;
use bonus_ledger::{BonusSystem, Config, HttpAccrualClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    let config = match std::env::var("BONUS_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config file {}", path))?,
        Err(_) => Config::from_env().context("Failed to read configuration from environment")?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = load_config()?;
    init_tracing(&config.log_format);

    tracing::info!(
        service = %config.service_name,
        run_address = %config.run_address,
        accrual_address = %config.accrual_address,
        "Starting bonus ledger"
    );

    let system = BonusSystem::from_config(&config)
        .await
        .context("Failed to open storage")?;

    let authority = HttpAccrualClient::new(
        config.accrual_address.clone(),
        config.reconciliation.request_timeout(),
    )?
    .with_rate_limit_backoff(config.reconciliation.rate_limit_backoff());

    let shutdown = CancellationToken::new();
    let reconciler = system.spawn_reconciliation(
        Arc::new(authority),
        config.reconciliation.clone(),
        shutdown.clone(),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    reconciler.await.context("Reconciliation task panicked")?;
    system.close().await;

    tracing::info!("Bonus ledger stopped");
    Ok(())
}
