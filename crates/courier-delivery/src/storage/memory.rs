//! In-memory job store.
//!
//! Deterministic storage for tests and for running the engine without a
//! database. A single mutex guards all state, so each trait method is one
//! atomic step exactly like its PostgreSQL counterpart. Failures can be
//! injected to exercise the engine's handling of an unavailable store.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    CoreError, DeliveryAttempt, DeliveryJob, EmailTemplate, EndpointId, Enqueued, JobFilter,
    JobId, JobOutcome, JobPage, JobStatus, NewJob, QueueStats, Result, WebhookEndpoint,
};
use tokio::sync::Mutex;

use super::JobStore;

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, DeliveryJob>,
    attempts: Vec<DeliveryAttempt>,
    templates: HashMap<String, EmailTemplate>,
    endpoints: HashMap<EndpointId, WebhookEndpoint>,
    injected_errors: Vec<String>,
}

impl State {
    fn take_injected_error(&mut self) -> Result<()> {
        if self.injected_errors.is_empty() {
            return Ok(());
        }
        Err(CoreError::Database(self.injected_errors.remove(0)))
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut DeliveryJob> {
        self.jobs.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))
    }
}

/// Job store keeping every record in process memory.
///
/// Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore").finish_non_exhaustive()
    }
}

impl InMemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next store operation fail with a database error carrying
    /// `error`. Repeated calls queue further failures.
    pub async fn inject_error(&self, error: impl Into<String>) {
        self.state.lock().await.injected_errors.push(error.into());
    }

    /// Inserts a job as-is, bypassing dedup.
    pub async fn insert_job(&self, job: DeliveryJob) {
        self.state.lock().await.jobs.insert(job.id, job);
    }

    /// Returns every recorded delivery attempt in recording order.
    pub async fn recorded_attempts(&self) -> Vec<DeliveryAttempt> {
        self.state.lock().await.attempts.clone()
    }

    /// Returns every job, oldest first.
    pub async fn all_jobs(&self) -> Vec<DeliveryJob> {
        let mut jobs: Vec<_> = self.state.lock().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
        dedup_since: DateTime<Utc>,
    ) -> Result<Enqueued> {
        job.validate()?;
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        if let Some(key) = job.idempotency_key.as_deref() {
            let kind = job.kind();
            let existing = state
                .jobs
                .values()
                .filter(|existing| {
                    existing.kind == kind
                        && existing.idempotency_key.as_deref() == Some(key)
                        && existing.created_at >= dedup_since
                })
                .max_by_key(|existing| existing.created_at);
            if let Some(existing) = existing {
                return Ok(Enqueued::Duplicate(existing.id));
            }
        }

        let job = job.into_job(now);
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(Enqueued::Created(id))
    }

    async fn lease(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Vec<DeliveryJob>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut due: Vec<_> = state
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .map(|job| (job.priority, job.created_at, job.id))
            .collect();
        due.sort_unstable();

        let mut leased = Vec::with_capacity(batch_size.min(due.len()));
        for (_, _, id) in due.into_iter().take(batch_size) {
            let job = state.job_mut(id)?;
            job.lease(worker_id, now, lease_duration)?;
            leased.push(job.clone());
        }
        Ok(leased)
    }

    async fn report_outcome(
        &self,
        job_id: JobId,
        worker_id: &str,
        outcome: JobOutcome,
        attempt: DeliveryAttempt,
        now: DateTime<Utc>,
    ) -> Result<DeliveryJob> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut job = state.job_mut(job_id)?.clone();
        state.attempts.push(attempt);
        job.apply_outcome(worker_id, &outcome, now)?;
        state.jobs.insert(job_id, job.clone());
        Ok(job)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryJob>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut reclaimed: Vec<_> = state
            .jobs
            .values_mut()
            .filter_map(|job| job.reclaim(now).then(|| job.clone()))
            .collect();
        reclaimed.sort_by_key(|job| (job.priority, job.created_at, job.id));
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut matching: Vec<_> =
            state.jobs.values().filter(|job| filter.matches(job)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let offset = usize::try_from(filter.offset()).unwrap_or(usize::MAX);
        let jobs =
            matching.into_iter().skip(offset).take(filter.per_page() as usize).collect();

        Ok(JobPage { jobs, page: filter.page(), per_page: filter.per_page(), total })
    }

    async fn attempts(&self, id: JobId) -> Result<Vec<DeliveryAttempt>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut attempts: Vec<_> =
            state.attempts.iter().filter(|attempt| attempt.job_id == id).cloned().collect();
        attempts.sort_by_key(|attempt| (attempt.attempt_number, attempt.attempted_at));
        Ok(attempts)
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<DeliveryJob> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let job = state.job_mut(id)?;
        job.cancel(now)?;
        Ok(job.clone())
    }

    async fn retry_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Enqueued> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let original = state.job_mut(id)?.clone();
        if let Some(existing) = state.jobs.values().find(|job| job.retried_from == Some(id)) {
            return Ok(Enqueued::Duplicate(existing.id));
        }

        let copy = original.retry_copy()?.into_job(now);
        let new_id = copy.id;
        state.jobs.insert(new_id, copy);
        Ok(Enqueued::Created(new_id))
    }

    async fn status_counts(&self) -> Result<QueueStats> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut stats = QueueStats::default();
        for status in JobStatus::ALL {
            let count = state.jobs.values().filter(|job| job.status == status).count();
            stats.add(status, count as u64);
        }
        Ok(stats)
    }

    async fn find_template(&self, name: &str) -> Result<Option<EmailTemplate>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;
        Ok(state.templates.get(name).cloned())
    }

    async fn save_template(&self, mut template: EmailTemplate) -> Result<EmailTemplate> {
        template.validate()?;
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        if let Some(existing) = state.templates.get(&template.name) {
            template.id = existing.id;
            template.created_at = existing.created_at;
        }
        state.templates.insert(template.name.clone(), template.clone());
        Ok(template)
    }

    async fn list_templates(&self) -> Result<Vec<EmailTemplate>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut templates: Vec<_> = state.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn find_endpoint(&self, id: EndpointId) -> Result<Option<WebhookEndpoint>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;
        Ok(state.endpoints.get(&id).cloned())
    }

    async fn save_endpoint(&self, mut endpoint: WebhookEndpoint) -> Result<WebhookEndpoint> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        if let Some(existing) = state.endpoints.get(&endpoint.id) {
            endpoint.created_at = existing.created_at;
        }
        state.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    async fn subscribed_endpoints(&self, event_type: &str) -> Result<Vec<WebhookEndpoint>> {
        let mut state = self.state.lock().await;
        state.take_injected_error()?;

        let mut endpoints: Vec<_> = state
            .endpoints
            .values()
            .filter(|endpoint| endpoint.subscribes_to(event_type))
            .cloned()
            .collect();
        endpoints.sort_by_key(|endpoint| (endpoint.created_at, endpoint.id.0));
        Ok(endpoints)
    }

    async fn health_check(&self) -> Result<()> {
        self.state.lock().await.take_injected_error()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{AttemptOutcome, TemplateVariables};
    use uuid::Uuid;

    use super::*;

    const LEASE: Duration = Duration::from_secs(300);

    fn email(key: Option<&str>) -> NewJob {
        let job = NewJob::email("jan@example.com", None, "welcome", TemplateVariables::new());
        match key {
            Some(key) => job.with_idempotency_key(key),
            None => job,
        }
    }

    fn attempt(job_id: JobId, worker_id: &str, now: DateTime<Utc>) -> DeliveryAttempt {
        DeliveryAttempt {
            id: Uuid::new_v4(),
            job_id,
            attempt_number: 1,
            worker_id: worker_id.to_string(),
            outcome: AttemptOutcome::Sent,
            status_code: Some(250),
            error_message: None,
            duration_ms: 12,
            attempted_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_key_within_window_returns_existing_job() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let window_start = now - chrono::Duration::hours(24);

        let first = store.enqueue(email(Some("k1")), now, window_start).await.unwrap();
        let second = store.enqueue(email(Some("k1")), now, window_start).await.unwrap();

        assert!(!first.is_duplicate());
        assert_eq!(second, Enqueued::Duplicate(first.id()));
        assert_eq!(store.all_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_resolves_to_newest_job_in_window() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let older = email(Some("k1")).into_job(now - chrono::Duration::hours(2));
        let newer = email(Some("k1")).into_job(now - chrono::Duration::hours(1));
        let expired = email(Some("k1")).into_job(now - chrono::Duration::hours(30));
        store.insert_job(older).await;
        store.insert_job(newer.clone()).await;
        store.insert_job(expired).await;

        let result = store
            .enqueue(email(Some("k1")), now, now - chrono::Duration::hours(24))
            .await
            .unwrap();

        assert_eq!(result, Enqueued::Duplicate(newer.id));
    }

    #[tokio::test]
    async fn key_outside_window_creates_new_job() {
        let store = InMemoryJobStore::new();
        let created = Utc::now();
        store.enqueue(email(Some("k1")), created, created).await.unwrap();

        let later = created + chrono::Duration::hours(25);
        let result =
            store.enqueue(email(Some("k1")), later, later - chrono::Duration::hours(24)).await;

        assert!(!result.unwrap().is_duplicate());
        assert_eq!(store.all_jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn lease_orders_by_priority_then_age() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let low = store.enqueue(email(None).with_priority(9), now, now).await.unwrap();
        let old = store
            .enqueue(email(None), now + chrono::Duration::seconds(1), now)
            .await
            .unwrap();
        let young = store
            .enqueue(email(None), now + chrono::Duration::seconds(2), now)
            .await
            .unwrap();
        let urgent = store
            .enqueue(email(None).with_priority(1), now + chrono::Duration::seconds(3), now)
            .await
            .unwrap();

        let leased = store
            .lease("worker-1", 10, now + chrono::Duration::seconds(5), LEASE)
            .await
            .unwrap();
        let ids: Vec<_> = leased.iter().map(|job| job.id).collect();

        assert_eq!(ids, vec![urgent.id(), old.id(), young.id(), low.id()]);
    }

    #[tokio::test]
    async fn future_jobs_are_not_leased() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(email(None), now, now).await.unwrap().id();

        let mut job = store.get(id).await.unwrap().unwrap();
        job.scheduled_for = now + chrono::Duration::seconds(60);
        store.insert_job(job).await;

        assert!(store.lease("worker-1", 10, now, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outcome_after_lost_lease_records_attempt_only() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(email(None), now, now).await.unwrap().id();
        store.lease("worker-1", 1, now, LEASE).await.unwrap();

        let expired = now + chrono::Duration::seconds(301);
        store.reap_expired(expired).await.unwrap();
        store.lease("worker-2", 1, expired, LEASE).await.unwrap();

        let result = store
            .report_outcome(
                id,
                "worker-1",
                JobOutcome::Sent,
                attempt(id, "worker-1", expired),
                expired,
            )
            .await;

        assert!(matches!(result, Err(CoreError::LeaseLost(_))));
        assert_eq!(store.recorded_attempts().await.len(), 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Leased);
        assert_eq!(job.leased_by.as_deref(), Some("worker-2"));
    }

    #[tokio::test]
    async fn retrying_dead_job_twice_returns_same_copy() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(email(None), now, now).await.unwrap().id();
        store.cancel(id, now).await.unwrap();

        let first = store.retry_dead(id, now).await.unwrap();
        let second = store.retry_dead(id, now).await.unwrap();

        assert!(!first.is_duplicate());
        assert_eq!(second, Enqueued::Duplicate(first.id()));
        let copy = store.get(first.id()).await.unwrap().unwrap();
        assert_eq!(copy.status, JobStatus::Queued);
        assert_eq!(copy.retried_from, Some(id));
    }

    #[tokio::test]
    async fn injected_error_fails_next_operation_only() {
        let store = InMemoryJobStore::new();
        store.inject_error("connection refused").await;

        let result = store.status_counts().await;
        assert!(matches!(result, Err(CoreError::Database(ref msg)) if msg == "connection refused"));
        assert!(store.status_counts().await.is_ok());
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for offset in 0..5 {
            store.enqueue(email(None), now + chrono::Duration::seconds(offset), now).await.unwrap();
        }

        let page = store
            .list(&JobFilter { page: 2, per_page: 2, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);
        assert_eq!(page.jobs[0].created_at, now + chrono::Duration::seconds(2));
        assert_eq!(page.jobs[1].created_at, now + chrono::Duration::seconds(1));
    }
}
