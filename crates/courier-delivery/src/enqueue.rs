//! Enqueue API used by collaborators to request deliveries.
//!
//! Requests are validated completely before a job exists: the template must
//! resolve and render with the supplied variables, the recipient must parse,
//! the event type must be in the catalog. A rejected request leaves no row
//! behind. Accepted requests return a job id at once and never wait on the
//! transport.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    models::{DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, HIGHEST_PRIORITY},
    Clock, Enqueued, NewJob, TemplateVariables,
};
use lettre::Address;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{EnqueueError, ValidationError},
    render::{EventCatalog, TemplateRenderer},
    scheduler::Wakeup,
    storage::JobStore,
};

/// Request to send one templated email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueEmail {
    /// Template name.
    pub template: String,
    /// Recipient address.
    pub to_address: String,
    /// Recipient display name.
    #[serde(default)]
    pub to_name: Option<String>,
    /// Template variables.
    #[serde(default)]
    pub variables: TemplateVariables,
    /// 1 (highest) to 10 (lowest), default 5.
    #[serde(default)]
    pub priority: Option<i16>,
    /// Attempt ceiling, default from configuration.
    #[serde(default)]
    pub max_attempts: Option<i32>,
    /// Collapses repeated requests within the dedup window.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl EnqueueEmail {
    /// Creates a request with default priority and no idempotency key.
    pub fn new(
        template: impl Into<String>,
        to_address: impl Into<String>,
        variables: TemplateVariables,
    ) -> Self {
        Self {
            template: template.into(),
            to_address: to_address.into(),
            to_name: None,
            variables,
            priority: None,
            max_attempts: None,
            idempotency_key: None,
        }
    }
}

/// Request to publish one event to every subscribed endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueWebhook {
    /// Event type from the catalog.
    pub event_type: String,
    /// Opaque event data.
    pub payload: serde_json::Value,
    /// 1 (highest) to 10 (lowest), default 5.
    #[serde(default)]
    pub priority: Option<i16>,
    /// Attempt ceiling, default from configuration.
    #[serde(default)]
    pub max_attempts: Option<i32>,
    /// Collapses repeated requests within the dedup window. Each endpoint's
    /// job is keyed `<key>:<endpoint id>`.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl EnqueueWebhook {
    /// Creates a request with default priority and no idempotency key.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            priority: None,
            max_attempts: None,
            idempotency_key: None,
        }
    }
}

/// Enqueue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueConfig {
    /// Window in which an idempotency key collapses duplicates.
    pub dedup_window: Duration,
    /// Attempt ceiling for requests that do not set one.
    pub default_max_attempts: i32,
}

impl Default for EnqueueConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(86_400),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Validates requests and writes jobs to the store.
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    renderer: Arc<TemplateRenderer>,
    catalog: EventCatalog,
    wakeup: Wakeup,
    config: EnqueueConfig,
    clock: Arc<dyn Clock>,
}

impl Enqueuer {
    /// Creates an enqueuer.
    ///
    /// `wakeup` must be the signal the engine's workers wait on.
    pub fn new(
        store: Arc<dyn JobStore>,
        catalog: EventCatalog,
        wakeup: Wakeup,
        config: EnqueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, renderer: Arc::new(TemplateRenderer::new()), catalog, wakeup, config, clock }
    }

    /// Event types webhooks may be enqueued for.
    pub fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    /// Enqueues one email.
    ///
    /// # Errors
    ///
    /// - `ValidationError::UnknownTemplate` when no template has the name
    /// - `ValidationError::MissingVariables` when required variables are
    ///   absent
    /// - `ValidationError::Render` when the template does not render with
    ///   the variables
    /// - `ValidationError::InvalidRecipient` when the address does not parse
    /// - `ValidationError::Invalid` for out-of-range priority or attempts
    /// - `EnqueueError::Store` when the job store is unavailable
    pub async fn enqueue_email(&self, request: EnqueueEmail) -> Result<Enqueued, EnqueueError> {
        let template = self
            .store
            .find_template(&request.template)
            .await?
            .ok_or_else(|| ValidationError::UnknownTemplate(request.template.clone()))?;
        self.renderer.render_email(&template, &request.variables).map_err(ValidationError::from)?;

        request
            .to_address
            .parse::<Address>()
            .map_err(|_| ValidationError::InvalidRecipient(request.to_address.clone()))?;

        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        let max_attempts = request.max_attempts.unwrap_or(self.config.default_max_attempts);
        let mut job =
            NewJob::email(request.to_address, request.to_name, request.template, request.variables)
                .with_priority(priority)
                .with_max_attempts(max_attempts);
        job.idempotency_key = request.idempotency_key;

        let enqueued = self.insert(job).await?;
        info!(
            job_id = %enqueued.id(),
            kind = "email",
            template = %template.name,
            priority,
            duplicate = enqueued.is_duplicate(),
            "email enqueued"
        );

        self.wake_if_urgent(priority, std::slice::from_ref(&enqueued));
        Ok(enqueued)
    }

    /// Enqueues one webhook job per active endpoint subscribed to the event.
    ///
    /// Returns one entry per endpoint, in endpoint creation order. An event
    /// with no subscribers is accepted and creates no jobs.
    ///
    /// # Errors
    ///
    /// - `ValidationError::UnknownEvent` when the event type is not in the
    ///   catalog
    /// - `ValidationError::Invalid` for out-of-range priority or attempts
    /// - `EnqueueError::Store` when the job store is unavailable; jobs for
    ///   endpoints already written stay written, and repeating the call with
    ///   the same idempotency key fills in the rest
    pub async fn enqueue_webhook(
        &self,
        request: EnqueueWebhook,
    ) -> Result<Vec<Enqueued>, EnqueueError> {
        self.catalog.validate(&request.event_type).map_err(ValidationError::from)?;

        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        let max_attempts = request.max_attempts.unwrap_or(self.config.default_max_attempts);

        let endpoints = self.store.subscribed_endpoints(&request.event_type).await?;
        if endpoints.is_empty() {
            debug!(event_type = %request.event_type, "no endpoints subscribed, nothing enqueued");
        }

        let mut results = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let mut job = NewJob::webhook(endpoint.id, &request.event_type, request.payload.clone())
                .with_priority(priority)
                .with_max_attempts(max_attempts);
            job.idempotency_key =
                request.idempotency_key.as_ref().map(|key| format!("{key}:{}", endpoint.id));

            let enqueued = self.insert(job).await?;
            info!(
                job_id = %enqueued.id(),
                kind = "webhook",
                event_type = %request.event_type,
                endpoint_id = %endpoint.id,
                priority,
                duplicate = enqueued.is_duplicate(),
                "webhook enqueued"
            );
            results.push(enqueued);
        }

        self.wake_if_urgent(priority, &results);
        Ok(results)
    }

    async fn insert(&self, job: NewJob) -> Result<Enqueued, EnqueueError> {
        let now = self.clock.now_utc();
        Ok(self.store.enqueue(job, now, self.dedup_since(now)).await?)
    }

    fn dedup_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.dedup_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn wake_if_urgent(&self, priority: i16, results: &[Enqueued]) {
        if priority == HIGHEST_PRIORITY && results.iter().any(|result| !result.is_duplicate()) {
            self.wakeup.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{EmailTemplate, TestClock};

    use super::*;
    use crate::storage::InMemoryJobStore;

    async fn enqueuer() -> (Enqueuer, Arc<InMemoryJobStore>) {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryJobStore::new());
        let template = EmailTemplate::new(
            "welcome",
            "Welcome, {{name}}",
            Some("Hi {{name}}".to_string()),
            None,
            vec!["name".to_string()],
            clock.now_utc(),
        )
        .unwrap();
        store.save_template(template).await.unwrap();

        let enqueuer = Enqueuer::new(
            store.clone(),
            EventCatalog::default(),
            Wakeup::new(),
            EnqueueConfig::default(),
            Arc::new(clock),
        );
        (enqueuer, store)
    }

    fn jan() -> TemplateVariables {
        let mut variables = TemplateVariables::new();
        variables.insert("name".to_string(), "Jan".into());
        variables
    }

    #[tokio::test]
    async fn rejects_unknown_template() {
        let (enqueuer, store) = enqueuer().await;

        let result =
            enqueuer.enqueue_email(EnqueueEmail::new("goodbye", "jan@example.com", jan())).await;

        assert!(matches!(
            result,
            Err(EnqueueError::Validation(ValidationError::UnknownTemplate(ref name)))
                if name == "goodbye"
        ));
        assert!(store.all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_recipient() {
        let (enqueuer, store) = enqueuer().await;

        let result =
            enqueuer.enqueue_email(EnqueueEmail::new("welcome", "not-an-email", jan())).await;

        assert!(matches!(
            result,
            Err(EnqueueError::Validation(ValidationError::InvalidRecipient(_)))
        ));
        assert!(store.all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_out_of_range_priority() {
        let (enqueuer, store) = enqueuer().await;
        let mut request = EnqueueEmail::new("welcome", "jan@example.com", jan());
        request.priority = Some(0);

        let result = enqueuer.enqueue_email(request).await;

        assert!(matches!(result, Err(EnqueueError::Validation(ValidationError::Invalid(_)))));
        assert!(store.all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_event() {
        let (enqueuer, _store) = enqueuer().await;

        let result = enqueuer
            .enqueue_webhook(EnqueueWebhook::new("article.archived", serde_json::json!({})))
            .await;

        assert!(matches!(
            result,
            Err(EnqueueError::Validation(ValidationError::UnknownEvent(_)))
        ));
    }

    #[tokio::test]
    async fn event_without_subscribers_creates_nothing() {
        let (enqueuer, store) = enqueuer().await;

        let result = enqueuer
            .enqueue_webhook(EnqueueWebhook::new("analytics.rollup", serde_json::json!({})))
            .await
            .unwrap();

        assert!(result.is_empty());
        assert!(store.all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn urgent_email_wakes_workers() {
        let (enqueuer, _store) = enqueuer().await;
        let wakeup = enqueuer.wakeup.clone();
        let notified = wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let mut request = EnqueueEmail::new("welcome", "jan@example.com", jan());
        request.priority = Some(HIGHEST_PRIORITY);
        enqueuer.enqueue_email(request).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), notified).await.unwrap();
    }
}
