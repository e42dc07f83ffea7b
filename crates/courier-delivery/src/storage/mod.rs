//! Job Store abstraction used by the scheduler, workers, enqueue API and
//! admin surface.
//!
//! Every state change goes through a `JobStore` method that is atomic on its
//! own: enqueue (dedup check plus insert), lease (select plus mark leased),
//! outcome report (lease check plus transition plus attempt record). Workers
//! share no in-memory state; the store is the only coordination point, so
//! any number of engine processes may run against one database.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    storage::Storage, CoreError, DeliveryAttempt, DeliveryJob, EmailTemplate, EndpointId,
    Enqueued, JobFilter, JobId, JobOutcome, JobPage, NewJob, QueueStats, Result,
    WebhookEndpoint,
};

pub mod memory;

pub use memory::InMemoryJobStore;

/// Persistent record of every delivery job; the single source of truth for
/// job state.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Creates a queued job, or returns the newest existing job of the same
    /// kind with the same idempotency key created at or after `dedup_since`.
    /// Check and insert are one atomic step.
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
        dedup_since: DateTime<Utc>,
    ) -> Result<Enqueued>;

    /// Leases up to `batch_size` queued jobs with `scheduled_for <= now` to
    /// `worker_id`, in `(priority, created_at)` order. No job is ever
    /// returned to two concurrent callers.
    async fn lease(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Vec<DeliveryJob>>;

    /// Records `attempt` and applies `outcome` to a job leased by
    /// `worker_id`.
    ///
    /// The attempt is recorded even when the lease was lost, in which case
    /// the job is left untouched and `CoreError::LeaseLost` is returned.
    async fn report_outcome(
        &self,
        job_id: JobId,
        worker_id: &str,
        outcome: JobOutcome,
        attempt: DeliveryAttempt,
        now: DateTime<Utc>,
    ) -> Result<DeliveryJob>;

    /// Returns every job whose lease expired at or before `now` to the
    /// queue without charging an attempt.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryJob>>;

    /// Loads one job.
    async fn get(&self, id: JobId) -> Result<Option<DeliveryJob>>;

    /// Lists jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<JobPage>;

    /// Attempt history of a job, oldest first.
    async fn attempts(&self, id: JobId) -> Result<Vec<DeliveryAttempt>>;

    /// Dead-letters a queued job with reason "cancelled".
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<DeliveryJob>;

    /// Creates a fresh job from a dead one. Retrying the same dead job again
    /// returns the job the first retry created.
    async fn retry_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Enqueued>;

    /// Job counts per status.
    async fn status_counts(&self) -> Result<QueueStats>;

    /// Loads a template by name.
    async fn find_template(&self, name: &str) -> Result<Option<EmailTemplate>>;

    /// Creates or replaces a template by name.
    async fn save_template(&self, template: EmailTemplate) -> Result<EmailTemplate>;

    /// All templates by name.
    async fn list_templates(&self) -> Result<Vec<EmailTemplate>>;

    /// Loads an endpoint.
    async fn find_endpoint(&self, id: EndpointId) -> Result<Option<WebhookEndpoint>>;

    /// Creates or replaces an endpoint by id.
    async fn save_endpoint(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint>;

    /// Active endpoints subscribed to `event_type`.
    async fn subscribed_endpoints(&self, event_type: &str) -> Result<Vec<WebhookEndpoint>>;

    /// Verifies the store is reachable.
    async fn health_check(&self) -> Result<()>;
}

fn job_not_found(id: JobId) -> CoreError {
    CoreError::NotFound(format!("job {id} not found"))
}

/// PostgreSQL job store.
///
/// Wraps `courier_core::storage::Storage` and composes its repositories
/// into the transactional operations the trait promises.
pub struct PostgresJobStore {
    storage: Arc<Storage>,
}

impl PostgresJobStore {
    /// Creates a new PostgreSQL job store.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
        dedup_since: DateTime<Utc>,
    ) -> Result<Enqueued> {
        job.validate()?;
        let kind = job.kind();
        let mut tx = self.storage.begin().await?;

        if let Some(key) = job.idempotency_key.as_deref() {
            self.storage.jobs.lock_idempotency_key_in_tx(&mut tx, kind, key).await?;
            if let Some(existing) =
                self.storage.jobs.find_duplicate_in_tx(&mut tx, kind, key, dedup_since).await?
            {
                tx.commit().await?;
                return Ok(Enqueued::Duplicate(existing));
            }
        }

        let id = self.storage.jobs.insert_in_tx(&mut tx, &job.into_job(now)).await?;
        tx.commit().await?;
        Ok(Enqueued::Created(id))
    }

    async fn lease(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Vec<DeliveryJob>> {
        let lease = chrono::Duration::from_std(lease_duration)
            .map_err(|e| CoreError::InvalidInput(format!("lease duration out of range: {e}")))?;
        self.storage.jobs.lease_due(worker_id, batch_size, now, now + lease).await
    }

    async fn report_outcome(
        &self,
        job_id: JobId,
        worker_id: &str,
        outcome: JobOutcome,
        attempt: DeliveryAttempt,
        now: DateTime<Utc>,
    ) -> Result<DeliveryJob> {
        let mut tx = self.storage.begin().await?;
        let mut job = self
            .storage
            .jobs
            .find_for_update_in_tx(&mut tx, job_id)
            .await?
            .ok_or_else(|| job_not_found(job_id))?;

        self.storage.delivery_attempts.create_in_tx(&mut tx, &attempt).await?;

        if let Err(error) = job.apply_outcome(worker_id, &outcome, now) {
            tx.commit().await?;
            return Err(error);
        }

        self.storage.jobs.update_state_in_tx(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryJob>> {
        self.storage.jobs.reclaim_expired(now).await
    }

    async fn get(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        self.storage.jobs.find_by_id(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        self.storage.jobs.list(filter).await
    }

    async fn attempts(&self, id: JobId) -> Result<Vec<DeliveryAttempt>> {
        self.storage.delivery_attempts.find_by_job(id).await
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<DeliveryJob> {
        let mut tx = self.storage.begin().await?;
        let mut job = self
            .storage
            .jobs
            .find_for_update_in_tx(&mut tx, id)
            .await?
            .ok_or_else(|| job_not_found(id))?;

        job.cancel(now)?;
        self.storage.jobs.update_state_in_tx(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn retry_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Enqueued> {
        let mut tx = self.storage.begin().await?;
        let original = self
            .storage
            .jobs
            .find_for_update_in_tx(&mut tx, id)
            .await?
            .ok_or_else(|| job_not_found(id))?;

        if let Some(existing) = self.storage.jobs.find_retry_of_in_tx(&mut tx, id).await? {
            tx.commit().await?;
            return Ok(Enqueued::Duplicate(existing));
        }

        let copy = original.retry_copy()?.into_job(now);
        let new_id = self.storage.jobs.insert_in_tx(&mut tx, &copy).await?;
        tx.commit().await?;
        Ok(Enqueued::Created(new_id))
    }

    async fn status_counts(&self) -> Result<QueueStats> {
        self.storage.jobs.count_by_status().await
    }

    async fn find_template(&self, name: &str) -> Result<Option<EmailTemplate>> {
        self.storage.templates.find_by_name(name).await
    }

    async fn save_template(&self, template: EmailTemplate) -> Result<EmailTemplate> {
        template.validate()?;
        self.storage.templates.upsert(&template).await
    }

    async fn list_templates(&self) -> Result<Vec<EmailTemplate>> {
        self.storage.templates.list().await
    }

    async fn find_endpoint(&self, id: EndpointId) -> Result<Option<WebhookEndpoint>> {
        self.storage.endpoints.find_by_id(id).await
    }

    async fn save_endpoint(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint> {
        self.storage.endpoints.upsert(&endpoint).await
    }

    async fn subscribed_endpoints(&self, event_type: &str) -> Result<Vec<WebhookEndpoint>> {
        self.storage.endpoints.find_subscribed(event_type).await
    }

    async fn health_check(&self) -> Result<()> {
        self.storage.health_check().await
    }
}
