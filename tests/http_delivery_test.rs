//! End-to-end tests through the HTTP surface and the delivery engine.
//!
//! Jobs are enqueued and inspected over HTTP while the engine delivers them
//! to a mock webhook receiver, all on one in-memory store and test clock.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier_api::{create_router, AppState};
use courier_core::{Clock, TestClock};
use courier_delivery::{
    retry::RetryPolicy, AdminService, DeliveryConfig, DeliveryEngine, EnqueueConfig, Enqueuer,
    EventCatalog, InMemoryJobStore, LogMailer, Wakeup,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::{
    matchers::{header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

struct Harness {
    clock: TestClock,
    engine: DeliveryEngine,
    router: Router,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let wakeup = Wakeup::new();

        let config = DeliveryConfig {
            worker_count: 1,
            retry_policy: RetryPolicy {
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(3600),
                jitter: false,
            },
            ..DeliveryConfig::default()
        };
        let engine = DeliveryEngine::new(
            store.clone(),
            Arc::new(LogMailer),
            wakeup.clone(),
            config,
            shared_clock.clone(),
        )
        .unwrap();

        let enqueuer = Enqueuer::new(
            store.clone(),
            EventCatalog::default(),
            wakeup.clone(),
            EnqueueConfig::default(),
            shared_clock.clone(),
        );
        let admin = AdminService::new(store.clone(), wakeup, shared_clock.clone());
        let state = AppState::new(store, enqueuer, admin, shared_clock);

        Self { clock, engine, router: create_router(state, Duration::from_secs(5)) }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body =
            if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    async fn register_endpoint(&self, url: String) {
        let (status, _) = self
            .call(
                "PUT",
                &format!("/endpoints/{}", uuid::Uuid::new_v4()),
                Some(json!({
                    "name": "search indexer",
                    "url": url,
                    "secret_key": "whsec_indexer",
                    "subscribed_events": ["article.published"],
                    "timeout_seconds": 5,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn publish(&self, key: &str) -> String {
        let (status, body) = self
            .call(
                "POST",
                "/enqueue/webhook",
                Some(json!({
                    "event_type": "article.published",
                    "payload": { "article_id": 42 },
                    "idempotency_key": key,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        body["jobs"][0]["job_id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn published_article_reaches_subscriber_and_is_reported_sent() {
    let harness = Harness::new();
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("X-Event-Type", "article.published"))
        .and(header_exists("X-Signature"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&receiver)
        .await;

    harness.register_endpoint(format!("{}/hooks", receiver.uri())).await;
    let id = harness.publish("article-42-published").await;

    assert_eq!(harness.engine.process_batch().await.unwrap(), 1);

    let (status, job) = harness.call("GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "sent");
    assert_eq!(job["attempts"], 1);
    assert_eq!(job["attempt_history"].as_array().unwrap().len(), 1);
    assert_eq!(job["attempt_history"][0]["status_code"], 204);

    let (_, stats) = harness.call("GET", "/stats", None).await;
    assert_eq!(stats["sent"], 1);
}

#[tokio::test]
async fn failing_subscriber_ends_dead_and_operator_retry_delivers() {
    let harness = Harness::new();
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&receiver)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    harness.register_endpoint(format!("{}/hooks", receiver.uri())).await;
    let id = harness.publish("article-43-published").await;

    for _ in 0..3 {
        assert_eq!(harness.engine.process_batch().await.unwrap(), 1);
        harness.clock.advance(Duration::from_secs(3600));
    }

    let (_, job) = harness.call("GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(job["status"], "dead");
    assert_eq!(job["attempts"], 3);
    assert!(job["last_error"].as_str().unwrap().contains("503"));

    let (status, retry) = harness.call("POST", &format!("/jobs/{id}/retry"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    let copy = retry["job_id"].as_str().unwrap().to_string();

    assert_eq!(harness.engine.process_batch().await.unwrap(), 1);

    let (_, copy_job) = harness.call("GET", &format!("/jobs/{copy}"), None).await;
    assert_eq!(copy_job["status"], "sent");
    assert_eq!(copy_job["retried_from"], id.as_str());

    let (_, original) = harness.call("GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(original["status"], "dead");
}

#[tokio::test]
async fn enqueued_email_is_delivered_through_log_mailer() {
    let harness = Harness::new();
    let (status, _) = harness
        .call(
            "PUT",
            "/templates/contact-confirmation",
            Some(json!({
                "subject": "We received your message, {{name}}",
                "body_text": "Thanks {{name}}, we will reply soon.",
                "required_variables": ["name"],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = harness
        .call(
            "POST",
            "/enqueue/email",
            Some(json!({
                "template": "contact-confirmation",
                "to_address": "visitor@example.com",
                "variables": { "name": "Ada" },
                "priority": 1,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["job_id"].as_str().unwrap().to_string();

    assert_eq!(harness.engine.process_batch().await.unwrap(), 1);

    let (_, job) = harness.call("GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(job["status"], "sent");
    assert_eq!(job["priority"], 1);
}
