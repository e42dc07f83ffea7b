//! Courier outbound delivery service.
//!
//! Main entry point. Loads configuration, connects to PostgreSQL, applies
//! the schema, starts the delivery engine and serves the HTTP API until a
//! shutdown signal arrives, then drains the workers.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{AppState, Config};
use courier_core::{storage::Storage, Clock, RealClock};
use courier_delivery::{
    AdminService, DeliveryEngine, Enqueuer, JobStore, LogMailer, Mailer, PostgresJobStore,
    SmtpMailer, Wakeup,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    info!(
        database_url = %config.database_url_masked(),
        workers = config.worker_pool_size,
        lease_seconds = config.lease_duration_seconds,
        "Starting courier delivery service"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    courier_core::storage::schema::apply(&db_pool).await.context("Failed to apply schema")?;
    info!("Database schema applied");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let wakeup = Wakeup::new();
    let store: Arc<dyn JobStore> =
        Arc::new(PostgresJobStore::new(Arc::new(Storage::new(db_pool.clone()))));

    let mut engine = DeliveryEngine::new(
        store.clone(),
        create_mailer(&config)?,
        wakeup.clone(),
        config.to_delivery_config(),
        clock.clone(),
    )?;
    engine.start().await?;

    let enqueuer = Enqueuer::new(
        store.clone(),
        config.event_catalog(),
        wakeup.clone(),
        config.to_enqueue_config(),
        clock.clone(),
    );
    let admin = AdminService::new(store.clone(), wakeup, clock.clone());
    let state = AppState::new(store, enqueuer, admin, clock);

    let addr = config.parse_server_addr()?;
    info!(addr = %addr, "Courier is ready to accept deliveries");

    let served = courier_api::start_server(state, addr, config.request_timeout()).await;

    info!("Draining delivery workers");
    let drained = engine.shutdown().await;

    db_pool.close().await;
    info!("Database connections closed");

    served.context("HTTP server failed")?;
    drained.context("Delivery engine did not shut down cleanly")?;

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(&config.rust_log).unwrap_or_else(|e| {
        eprintln!("Invalid RUST_LOG directive {:?}, falling back to info: {e}", config.rust_log);
        EnvFilter::new("info")
    });

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logs() {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);
        registry.with(fmt_layer).init();
    }
}

/// Picks the SMTP relay when one is configured, otherwise logs emails.
fn create_mailer(config: &Config) -> Result<Arc<dyn Mailer>> {
    match config.to_smtp_config() {
        Some(smtp) => {
            info!(host = %smtp.host, port = smtp.port, "Using SMTP relay");
            Ok(Arc::new(SmtpMailer::new(&smtp)?))
        },
        None => {
            warn!("SMTP_HOST is not set, emails will be logged instead of sent");
            Ok(Arc::new(LogMailer))
        },
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
