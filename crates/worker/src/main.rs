//! billsync standalone worker
//!
//! Runs the processing sweep, daily reconciliation and raw event
//! housekeeping without the HTTP server. Useful when the API runs with
//! `RUN_SCHEDULER=false` on several replicas.

use std::env;

use billsync_billing::processor::{DEFAULT_PROVIDER, DEFAULT_SUBSCRIPTION_PERIOD_DAYS};
use billsync_billing::{EventProcessor, ProcessorConfig, Stores};
use billsync_worker::{Scheduler, SchedulerConfig, SchedulerJobs};
use tracing::info;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,billsync_worker=debug,billsync_billing=debug")
    });

    if env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting billsync worker");

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = billsync_shared::create_pool(&database_url, 5).await?;
    info!("Database pool created");

    let processor = EventProcessor::new(
        Stores::postgres(pool),
        ProcessorConfig {
            provider: env::var("PROVIDER_NAME")
                .map(|p| p.to_lowercase())
                .unwrap_or_else(|_| DEFAULT_PROVIDER.to_string()),
            subscription_period_days: env::var("SUBSCRIPTION_PERIOD_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SUBSCRIPTION_PERIOD_DAYS),
        },
    );

    let mut scheduler = Scheduler::new(SchedulerJobs::new(processor, SchedulerConfig::from_env()));
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    scheduler.stop().await?;

    Ok(())
}
