//! Operator actions on existing jobs, templates and endpoints.

use std::sync::Arc;

use courier_core::{
    Clock, CoreError, DeliveryAttempt, DeliveryJob, EmailTemplate, EndpointId, Enqueued,
    JobFilter, JobId, JobPage, QueueStats, WebhookEndpoint,
};
use serde::Serialize;
use tracing::info;

use crate::{error::AdminError, scheduler::Wakeup, storage::JobStore};

/// A job together with its attempt history, oldest attempt first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetail {
    /// The job.
    #[serde(flatten)]
    pub job: DeliveryJob,
    /// Every recorded attempt. Serialized as `attempt_history` since the
    /// flattened job already carries an `attempts` count.
    #[serde(rename = "attempt_history")]
    pub attempts: Vec<DeliveryAttempt>,
}

/// Inspection and intervention for operators.
pub struct AdminService {
    store: Arc<dyn JobStore>,
    wakeup: Wakeup,
    clock: Arc<dyn Clock>,
}

impl AdminService {
    /// Creates the service.
    pub fn new(store: Arc<dyn JobStore>, wakeup: Wakeup, clock: Arc<dyn Clock>) -> Self {
        Self { store, wakeup, clock }
    }

    /// Lists jobs matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Store` when the job store is unavailable.
    pub async fn list(&self, filter: &JobFilter) -> Result<JobPage, AdminError> {
        Ok(self.store.list(filter).await?)
    }

    /// Returns one job and its attempts.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::NotFound` for an unknown id.
    pub async fn get(&self, id: JobId) -> Result<JobDetail, AdminError> {
        let job = self.store.get(id).await?.ok_or(AdminError::NotFound(id))?;
        let attempts = self.store.attempts(id).await?;
        Ok(JobDetail { job, attempts })
    }

    /// Re-enqueues a dead job as a fresh job with zero attempts.
    ///
    /// The dead job is left untouched. Retrying the same dead job again
    /// returns the job the first retry created.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::NotFound` for an unknown id and
    /// `AdminError::InvalidState` unless the job is dead.
    pub async fn retry(&self, id: JobId) -> Result<Enqueued, AdminError> {
        let enqueued = self
            .store
            .retry_dead(id, self.clock.now_utc())
            .await
            .map_err(|error| not_found_as(id, error))?;

        info!(
            job_id = %id,
            new_job_id = %enqueued.id(),
            duplicate = enqueued.is_duplicate(),
            "dead job re-enqueued by operator"
        );
        if !enqueued.is_duplicate() {
            self.wakeup.notify();
        }
        Ok(enqueued)
    }

    /// Cancels a queued job; it becomes dead with reason `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::NotFound` for an unknown id and
    /// `AdminError::InvalidState` unless the job is queued.
    pub async fn cancel(&self, id: JobId) -> Result<DeliveryJob, AdminError> {
        let job = self
            .store
            .cancel(id, self.clock.now_utc())
            .await
            .map_err(|error| not_found_as(id, error))?;

        info!(job_id = %id, "job cancelled by operator");
        Ok(job)
    }

    /// Job counts per status.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Store` when the job store is unavailable.
    pub async fn stats(&self) -> Result<QueueStats, AdminError> {
        Ok(self.store.status_counts().await?)
    }

    /// Creates or replaces a template by name.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::InvalidState` for an incomplete template.
    pub async fn save_template(
        &self,
        template: EmailTemplate,
    ) -> Result<EmailTemplate, AdminError> {
        let saved = self.store.save_template(template).await.map_err(invalid_input_as_state)?;
        info!(template = %saved.name, "template saved");
        Ok(saved)
    }

    /// All templates by name.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Store` when the job store is unavailable.
    pub async fn list_templates(&self) -> Result<Vec<EmailTemplate>, AdminError> {
        Ok(self.store.list_templates().await?)
    }

    /// Creates or replaces an endpoint by id.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Store` when the job store is unavailable.
    pub async fn save_endpoint(
        &self,
        endpoint: WebhookEndpoint,
    ) -> Result<WebhookEndpoint, AdminError> {
        let saved = self.store.save_endpoint(endpoint).await.map_err(invalid_input_as_state)?;
        info!(endpoint_id = %saved.id, active = saved.is_active, "endpoint saved");
        Ok(saved)
    }

    /// Returns one endpoint, if it exists.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Store` when the job store is unavailable.
    pub async fn find_endpoint(
        &self,
        id: EndpointId,
    ) -> Result<Option<WebhookEndpoint>, AdminError> {
        Ok(self.store.find_endpoint(id).await?)
    }
}

fn not_found_as(id: JobId, error: CoreError) -> AdminError {
    match error {
        CoreError::NotFound(_) => AdminError::NotFound(id),
        other => other.into(),
    }
}

fn invalid_input_as_state(error: CoreError) -> AdminError {
    match error {
        CoreError::InvalidInput(message) => AdminError::InvalidState(message),
        other => other.into(),
    }
}
