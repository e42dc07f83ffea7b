//! Delivery engine wiring the scheduler, workers and transports together.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌─────────────┐   ┌────────────┐
//! │ DeliveryEngine │──▶│ Worker Pool │──▶│ Dispatcher │
//! └────────────────┘   └─────────────┘   └────────────┘
//!         │                   │             │      │
//!         ▼                   ▼             ▼      ▼
//! ┌────────────────┐   ┌─────────────┐   ┌──────┐ ┌─────────┐
//! │ Lease Reaper   │──▶│ Job Store   │   │ SMTP │ │ Webhook │
//! └────────────────┘   └─────────────┘   └──────┘ └─────────┘
//! ```
//!
//! The engine owns nothing the store does not already know: stopping one
//! engine and starting another resumes from the store's state, and leases
//! held by a crashed engine come back through the reaper of any other.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    client::{ClientConfig, WebhookClient},
    dispatch::Dispatcher,
    error::{DeliveryError, Result},
    mailer::Mailer,
    render::TemplateRenderer,
    retry::RetryPolicy,
    scheduler::{Reaper, Scheduler, Wakeup},
    storage::JobStore,
    worker::{DeliveryWorker, WorkerContext},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum jobs a worker leases at once.
    pub batch_size: usize,

    /// Idle wait between lease polls when nothing is due.
    pub poll_interval: Duration,

    /// How long a lease is held before the reaper may reclaim the job.
    pub lease_duration: Duration,

    /// Backoff for transient failures.
    pub retry_policy: RetryPolicy,

    /// Timeout of one SMTP send.
    pub email_timeout: Duration,

    /// HTTP client configuration; its timeout applies to endpoints without
    /// one of their own.
    pub client_config: ClientConfig,

    /// Shutdown timeout - maximum time to wait for workers to complete.
    pub shutdown_timeout: Duration,

    /// Pause after a job store failure before a worker tries again.
    pub store_error_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(300),
            retry_policy: RetryPolicy::default(),
            email_timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            client_config: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            store_error_backoff: Duration::from_secs(5),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` naming the first invalid
    /// field.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        if self.lease_duration.is_zero() {
            return Err(DeliveryError::configuration("lease_duration must be positive"));
        }
        if self.retry_policy.base_delay > self.retry_policy.max_delay {
            return Err(DeliveryError::configuration(
                "retry base delay must not exceed the maximum delay",
            ));
        }
        Ok(())
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Jobs attempted since startup.
    pub jobs_processed: u64,
    /// Jobs delivered.
    pub sent: u64,
    /// Failed attempts rescheduled for retry.
    pub retried: u64,
    /// Jobs moved to dead.
    pub dead_lettered: u64,
    /// Jobs currently being delivered.
    pub in_flight: u64,
    /// Expired leases returned to the queue.
    pub leases_reclaimed: u64,
}

/// Main delivery engine coordinating the worker pool.
pub struct DeliveryEngine {
    context: WorkerContext,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates a new delivery engine.
    ///
    /// `wakeup` must be the signal handed to the `Enqueuer`, so urgent jobs
    /// reach idle workers without waiting out the poll interval.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid or the HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn JobStore>,
        mailer: Arc<dyn Mailer>,
        wakeup: Wakeup,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(WebhookClient::new(config.client_config.clone())?);
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(TemplateRenderer::new()),
            mailer,
            client,
            config.email_timeout,
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            clock.clone(),
            config.lease_duration,
            config.batch_size,
        ));

        let instance = Uuid::new_v4().simple().to_string();
        let context = WorkerContext {
            instance_id: format!("worker-{}", &instance[..8]),
            store,
            scheduler,
            dispatcher,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            wakeup,
            clock,
        };

        Ok(Self { context, worker_pool: None })
    }

    /// Starts the worker pool and the lease reaper.
    ///
    /// Returns immediately after spawning workers. Use `shutdown()` to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the engine was already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.context.config.worker_count,
            batch_size = self.context.config.batch_size,
            lease_seconds = self.context.config.lease_duration.as_secs(),
            instance = %self.context.instance_id,
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(self.context.clone());
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Stops leasing new jobs and waits for in-flight deliveries to finish,
    /// bounded by the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns error if graceful shutdown fails or times out.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.context.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.context.stats.read().await.clone()
    }

    /// Returns true while the engine has running workers.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Leases and processes exactly one batch on the calling task, without
    /// starting background workers. Returns how many jobs were leased.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the job store fails.
    pub async fn process_batch(&self) -> Result<usize> {
        DeliveryWorker::manual(self.context.clone()).process_batch().await
    }

    /// Runs one lease-expiry sweep on the calling task. Returns how many
    /// jobs were reclaimed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the job store fails.
    pub async fn reap_expired(&self) -> Result<usize> {
        Reaper::new(
            self.context.store.clone(),
            self.context.clock.clone(),
            self.context.config.lease_duration,
            self.context.stats.clone(),
            self.context.cancellation_token.clone(),
        )
        .reap_once()
        .await
    }
}
