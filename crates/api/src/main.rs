#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! billsync API Server
//!
//! Runs the webhook receiver and admin routes, the dispatch worker that
//! processes accepted deliveries, and (unless `RUN_SCHEDULER=false`) the
//! sweep, reconciliation and housekeeping jobs, all in one process.

use std::net::SocketAddr;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use billsync_api::{config::LogFormat, routes::create_router, AppState, Config};
use billsync_billing::Stores;
use billsync_shared::{create_pool, run_migrations};
use billsync_worker::{Scheduler, SchedulerJobs};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,billsync_api=debug,billsync_billing=debug".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!("Starting billsync API Server v{}", env!("CARGO_PKG_VERSION"));

    // Create database pool
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        run_migrations(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped");
    }

    let (state, worker) = AppState::new(
        config.clone(),
        Stores::postgres(pool.clone()),
        Some(pool),
    );
    let dispatch_handle = tokio::spawn(worker.run());

    let mut scheduler = Scheduler::new(SchedulerJobs::new(
        state.processor.clone(),
        config.scheduler.clone(),
    ));
    if config.run_scheduler {
        scheduler.start().await?;
    } else {
        tracing::info!("Scheduler disabled (RUN_SCHEDULER=false)");
    }

    // Build the router
    let app = create_router(state).layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router held the last dispatcher; the worker drains what is queued and exits
    scheduler.stop().await?;
    if let Err(e) = dispatch_handle.await {
        tracing::error!(error = %e, "Dispatch worker terminated abnormally");
    }

    tracing::info!("billsync API Server stopped");
    Ok(())
}
