//! Shared fixtures for delivery integration tests.
//!
//! `TestEnv` wires an engine, enqueuer and admin service to one in-memory
//! store and one `TestClock`, so tests drive leasing, backoff and lease
//! expiry deterministically by calling `process_batch`/`reap_expired` and
//! moving the clock.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    Clock, DeliveryJob, EmailTemplate, EndpointId, JobId, TestClock, WebhookEndpoint,
};
use courier_delivery::{
    mailer::{MailReceipt, OutgoingEmail},
    retry::RetryPolicy,
    AdminService, DeliveryConfig, DeliveryEngine, DeliveryError, EnqueueConfig, Enqueuer,
    EventCatalog, InMemoryJobStore, JobStore, Mailer, Wakeup,
};
use sqlx::types::Json;

/// Mailer that records every message and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failures: Mutex<VecDeque<DeliveryError>>,
}

impl RecordingMailer {
    /// Makes the next send fail with `error`. Repeated calls queue further
    /// failures.
    pub fn fail_next(&self, error: DeliveryError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Messages accepted so far, in send order.
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> courier_delivery::Result<MailReceipt> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(MailReceipt { code: Some(250), message: "queued".to_string() })
    }
}

/// Engine configuration with deterministic backoff and a single worker.
pub fn test_config() -> DeliveryConfig {
    DeliveryConfig {
        worker_count: 1,
        batch_size: 1,
        poll_interval: Duration::from_millis(50),
        retry_policy: RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter: false,
        },
        ..Default::default()
    }
}

/// In-memory delivery stack driven by a test clock.
pub struct TestEnv {
    pub store: Arc<InMemoryJobStore>,
    pub clock: TestClock,
    pub mailer: Arc<RecordingMailer>,
    pub wakeup: Wakeup,
    pub engine: DeliveryEngine,
    pub enqueuer: Enqueuer,
    pub admin: AdminService,
}

impl TestEnv {
    /// Creates an environment with `test_config()`.
    pub fn new() -> Result<Self> {
        Self::with_config(test_config())
    }

    /// Creates an environment with the given engine configuration.
    pub fn with_config(config: DeliveryConfig) -> Result<Self> {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = TestClock::new();
        let mailer = Arc::new(RecordingMailer::default());
        let wakeup = Wakeup::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        let engine = DeliveryEngine::new(
            store.clone(),
            mailer.clone(),
            wakeup.clone(),
            config,
            shared_clock.clone(),
        )?;
        let enqueuer = Enqueuer::new(
            store.clone(),
            EventCatalog::default(),
            wakeup.clone(),
            EnqueueConfig::default(),
            shared_clock.clone(),
        );
        let admin = AdminService::new(store.clone(), wakeup.clone(), shared_clock);

        Ok(Self { store, clock, mailer, wakeup, engine, enqueuer, admin })
    }

    /// Current test time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Moves the clock to `at`.
    pub fn advance_to(&self, at: DateTime<Utc>) {
        self.clock.jump_to(SystemTime::from(at));
    }

    /// Stores a template with a text body.
    pub async fn create_template(
        &self,
        name: &str,
        subject: &str,
        text: &str,
        required: &[&str],
    ) -> Result<EmailTemplate> {
        let template = EmailTemplate::new(
            name,
            subject,
            Some(text.to_string()),
            None,
            required.iter().map(ToString::to_string).collect(),
            self.now(),
        )?;
        Ok(self.store.save_template(template).await?)
    }

    /// Stores an active endpoint subscribed to `events`.
    pub async fn create_endpoint(&self, url: &str, events: &[&str]) -> Result<WebhookEndpoint> {
        let now = self.now();
        let endpoint = WebhookEndpoint {
            id: EndpointId::new(),
            name: "test endpoint".to_string(),
            url: url.to_string(),
            secret_key: "whsec_test_secret".to_string(),
            subscribed_events: events.iter().map(ToString::to_string).collect(),
            is_active: true,
            timeout_seconds: 5,
            custom_headers: Json(HashMap::new()),
            created_at: now,
            updated_at: now,
        };
        Ok(self.store.save_endpoint(endpoint).await?)
    }

    /// Reads a job, failing if it does not exist.
    pub async fn job(&self, id: JobId) -> Result<DeliveryJob> {
        self.store.get(id).await?.ok_or_else(|| anyhow::anyhow!("job {id} not found"))
    }
}
