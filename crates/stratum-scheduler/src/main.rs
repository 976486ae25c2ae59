//! Stratum scheduler binary.
//!
//! Connects to the document store, the lock service, and the work queue,
//! then runs the scheduling loop. Any initialisation failure is fatal and
//! exits non-zero; once the loop is running, failures are recovered locally
//! and the process only stops on signal.

use std::sync::Arc;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stratum_scheduler::{
    Config, PostgresStore, Result, Scheduler, SchedulerError, SchedulerSettings,
    ValkeyLockService, ValkeyPublisher,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stratum_scheduler=info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal initialisation failure");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Stratum scheduler starting");

    let config: Config = Figment::new()
        .merge(Toml::file("stratum.toml"))
        .merge(Env::prefixed("STRATUM_").split("__"))
        .extract()
        .map_err(|e| SchedulerError::config(e.to_string()))?;

    let store = Arc::new(PostgresStore::new(&config.store).await?);
    info!(url = %config.store.url, "Connected to document store");

    let locks = Arc::new(ValkeyLockService::new(&config.lock).await?);
    info!(
        url = %config.lock.url,
        ttl_secs = config.lock.ttl_secs,
        "Connected to lock service"
    );

    let publisher = Arc::new(ValkeyPublisher::new(&config.queue).await?);
    info!(url = %config.queue.url, queue = %config.queue.queue, "Connected to work queue");

    let settings = SchedulerSettings::from_config(&config);
    let mut scheduler = Scheduler::new(store, locks, publisher, settings);
    scheduler.run().await;

    Ok(())
}
