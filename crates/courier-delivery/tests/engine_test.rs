//! Integration tests for the delivery engine lifecycle.
//!
//! These run the real worker pool on a real clock: start, deliver through
//! background workers, wake idle workers for urgent jobs and shut down
//! gracefully.

#![allow(clippy::unwrap_used)]

mod common;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use common::{test_config, RecordingMailer};
use courier_core::{EmailTemplate, JobId, JobStatus, RealClock, TemplateVariables};
use courier_delivery::{
    DeliveryConfig, DeliveryEngine, EnqueueConfig, EnqueueEmail, Enqueuer, EventCatalog,
    InMemoryJobStore, JobStore, Wakeup,
};

struct LiveEnv {
    store: Arc<InMemoryJobStore>,
    mailer: Arc<RecordingMailer>,
    engine: DeliveryEngine,
    enqueuer: Enqueuer,
}

async fn live_env(config: DeliveryConfig) -> Result<LiveEnv> {
    let store = Arc::new(InMemoryJobStore::new());
    let mailer = Arc::new(RecordingMailer::default());
    let wakeup = Wakeup::new();
    let clock = Arc::new(RealClock::new());

    let template = EmailTemplate::new(
        "welcome",
        "Welcome, {{name}}",
        Some("Hi {{name}}".to_string()),
        None,
        vec!["name".to_string()],
        chrono::Utc::now(),
    )?;
    store.save_template(template).await?;

    let engine =
        DeliveryEngine::new(store.clone(), mailer.clone(), wakeup.clone(), config, clock.clone())?;
    let enqueuer = Enqueuer::new(
        store.clone(),
        EventCatalog::default(),
        wakeup,
        EnqueueConfig::default(),
        clock,
    );

    Ok(LiveEnv { store, mailer, engine, enqueuer })
}

fn welcome(address: &str) -> EnqueueEmail {
    let mut variables = TemplateVariables::new();
    variables.insert("name".to_string(), "Jan".into());
    EnqueueEmail::new("welcome", address, variables)
}

async fn wait_until_sent(store: &InMemoryJobStore, ids: &[JobId], limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        let mut all_sent = true;
        for id in ids {
            let job = store.get(*id).await.unwrap().unwrap();
            all_sent &= job.status == JobStatus::Sent;
        }
        if all_sent {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn background_workers_deliver_queued_jobs() -> Result<()> {
    let mut env = live_env(DeliveryConfig { worker_count: 3, ..test_config() }).await?;
    env.engine.start().await?;
    assert!(env.engine.is_running());
    assert_eq!(env.engine.stats().await.active_workers, 3);

    let mut ids = Vec::new();
    for n in 0..6 {
        let enqueued = env.enqueuer.enqueue_email(welcome(&format!("user-{n}@example.com"))).await?;
        ids.push(enqueued.id());
    }

    assert!(wait_until_sent(&env.store, &ids, Duration::from_secs(5)).await);
    assert_eq!(env.mailer.sent().len(), 6);

    let stats = env.engine.stats().await;
    assert_eq!(stats.sent, 6);
    assert_eq!(stats.in_flight, 0);

    env.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn urgent_job_wakes_idle_workers() -> Result<()> {
    let config = DeliveryConfig { poll_interval: Duration::from_secs(60), ..test_config() };
    let mut env = live_env(config).await?;
    env.engine.start().await?;

    // Let the worker find an empty queue and go idle.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut request = welcome("reset@example.com");
    request.priority = Some(1);
    let id = env.enqueuer.enqueue_email(request).await?.id();

    assert!(
        wait_until_sent(&env.store, &[id], Duration::from_secs(5)).await,
        "urgent job should not wait out the poll interval"
    );

    env.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_idle_workers_promptly() -> Result<()> {
    let config = DeliveryConfig {
        poll_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let mut env = live_env(config).await?;
    env.engine.start().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    env.engine.shutdown().await?;
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn engine_cannot_start_twice() -> Result<()> {
    let mut env = live_env(test_config()).await?;
    env.engine.start().await?;

    assert!(env.engine.start().await.is_err());

    env.engine.shutdown().await?;
    Ok(())
}
