//! Delivery workers.
//!
//! A worker leases a batch, makes one transport attempt per job, lets the
//! retry policy classify the outcome and reports it back to the job store.
//! Workers share nothing but the store, the transports and the stats
//! counters.

use std::{sync::Arc, time::Duration};

use courier_core::{
    AttemptOutcome, Clock, CoreError, DeliveryAttempt, DeliveryJob, JobOutcome, JobStatus,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    dispatch::Dispatcher,
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, FailureClass, Result},
    retry::{RetryContext, RetryDecision},
    scheduler::{Scheduler, Wakeup},
    storage::JobStore,
};

const REPORT_ATTEMPTS: u32 = 3;
const REPORT_BACKOFF: Duration = Duration::from_millis(200);

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) instance_id: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) config: DeliveryConfig,
    pub(crate) stats: Arc<RwLock<EngineStats>>,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) wakeup: Wakeup,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Individual worker that processes deliveries.
pub struct DeliveryWorker {
    id: usize,
    name: String,
    context: WorkerContext,
}

impl DeliveryWorker {
    pub(crate) fn new(id: usize, context: WorkerContext) -> Self {
        let name = format!("{}-{id}", context.instance_id);
        Self { id, name, context }
    }

    /// Worker driven from the caller's task instead of the pool. Its lease
    /// holder name never matches a pool worker's.
    pub(crate) fn manual(context: WorkerContext) -> Self {
        let name = format!("{}-manual", context.instance_id);
        Self { id: usize::MAX, name, context }
    }

    /// Lease holder name, unique across engine instances.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Main worker loop: leases and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails. Batch failures are logged
    /// and retried after `store_error_backoff`.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, name = %self.name, "delivery worker starting");

        loop {
            if self.context.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            let notified = self.context.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.context.clock.sleep(self.context.config.poll_interval) => {},
                        () = &mut notified => {
                            debug!(worker_id = self.id, "woken for urgent job");
                        },
                        () = self.context.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    let backoff = self.context.config.store_error_backoff;
                    tokio::select! {
                        () = self.context.clock.sleep(backoff) => {},
                        () = self.context.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Leases and processes one batch, returning how many jobs were leased.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` when the job store fails. Jobs
    /// still leased at that point are left for the reaper and are not
    /// charged an attempt.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self.context.scheduler.lease_batch(&self.name).await?;
        let batch_size = jobs.len();

        for job in jobs {
            if self.context.cancellation_token.is_cancelled() {
                break;
            }

            if job.lease_expired(self.context.clock.now_utc()) {
                warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    "lease expired before delivery started, skipping job"
                );
                continue;
            }

            self.process_job(job).await?;
        }

        Ok(batch_size)
    }

    async fn process_job(&self, job: DeliveryJob) -> Result<()> {
        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight += 1;
        }

        let result = self.attempt_delivery(&job).await;

        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight -= 1;
            stats.jobs_processed += 1;
        }

        result
    }

    async fn attempt_delivery(&self, job: &DeliveryJob) -> Result<()> {
        let attempt_number = job.attempt_number();
        debug!(
            worker_id = self.id,
            job_id = %job.id,
            kind = %job.kind,
            attempt = attempt_number,
            "attempting delivery"
        );

        let start_time = self.context.clock.now();
        let result = self.context.dispatcher.dispatch(job).await;
        let duration = self.context.clock.now().saturating_duration_since(start_time);
        let finished_at = self.context.clock.now_utc();

        let (outcome, attempt_outcome, status_code, error_message) = match result {
            Ok(delivered) => (JobOutcome::Sent, AttemptOutcome::Sent, delivered.status_code, None),
            Err(error @ DeliveryError::DatabaseError { .. }) => return Err(error),
            Err(error) => {
                let context = RetryContext::new(
                    u32::try_from(attempt_number).unwrap_or(u32::MAX),
                    u32::try_from(job.max_attempts).unwrap_or(0),
                    error.clone(),
                    finished_at,
                    self.context.config.retry_policy.clone(),
                );
                let outcome = match context.decide_retry() {
                    RetryDecision::Retry { next_attempt_at } => JobOutcome::Retry {
                        scheduled_for: next_attempt_at,
                        error: error.to_string(),
                    },
                    RetryDecision::GiveUp { reason } => {
                        debug!(job_id = %job.id, reason = %reason, "giving up on job");
                        JobOutcome::Dead { error: error.to_string() }
                    },
                };
                let class = match error.failure_class() {
                    FailureClass::Transient => AttemptOutcome::Transient,
                    FailureClass::Permanent => AttemptOutcome::Permanent,
                };
                (outcome, class, error.status_code(), Some(error.to_string()))
            },
        };

        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            job_id: job.id,
            attempt_number,
            worker_id: self.name.clone(),
            outcome: attempt_outcome,
            status_code: status_code.map(i32::from),
            error_message,
            duration_ms: i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
            attempted_at: finished_at,
        };

        let Some(updated) = self.report(job, outcome, attempt).await? else {
            return Ok(());
        };
        self.record_result(&updated, duration).await;
        Ok(())
    }

    /// Reports an outcome, retrying transient store failures.
    ///
    /// Returns `None` when the lease was lost to another worker.
    async fn report(
        &self,
        job: &DeliveryJob,
        outcome: JobOutcome,
        attempt: DeliveryAttempt,
    ) -> Result<Option<DeliveryJob>> {
        let mut backoff = REPORT_BACKOFF;

        for report_attempt in 1..=REPORT_ATTEMPTS {
            let result = self
                .context
                .store
                .report_outcome(
                    job.id,
                    &self.name,
                    outcome.clone(),
                    attempt.clone(),
                    self.context.clock.now_utc(),
                )
                .await;

            match result {
                Ok(updated) => return Ok(Some(updated)),
                Err(CoreError::LeaseLost(reason)) => {
                    warn!(
                        worker_id = self.id,
                        job_id = %job.id,
                        reason = %reason,
                        "lease lost before outcome was reported, outcome discarded"
                    );
                    return Ok(None);
                },
                Err(error) if error.is_transient() && report_attempt < REPORT_ATTEMPTS => {
                    warn!(
                        worker_id = self.id,
                        job_id = %job.id,
                        report_attempt,
                        error = %error,
                        "failed to report outcome, retrying"
                    );
                    self.context.clock.sleep(backoff).await;
                    backoff *= 2;
                },
                Err(error) => {
                    return Err(DeliveryError::database(format!(
                        "failed to report outcome for job {}: {error}",
                        job.id
                    )));
                },
            }
        }

        Err(DeliveryError::database(format!("failed to report outcome for job {}", job.id)))
    }

    async fn record_result(&self, job: &DeliveryJob, duration: Duration) {
        let mut stats = self.context.stats.write().await;

        match job.status {
            JobStatus::Sent => {
                stats.sent += 1;
                info!(
                    worker_id = self.id,
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    duration_ms = duration.as_millis(),
                    "job delivered"
                );
            },
            JobStatus::Queued => {
                stats.retried += 1;
                warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    next_attempt_at = %job.scheduled_for,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "delivery failed, retry scheduled"
                );
            },
            JobStatus::Dead => {
                stats.dead_lettered += 1;
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "job dead-lettered"
                );
            },
            JobStatus::Leased => {},
        }
    }
}
