//! Lease polling, urgent-job wake-up and lease-expiry reaping.
//!
//! Workers pull due jobs through `Scheduler::lease_batch` and idle on a short
//! poll interval when nothing is due. `Wakeup` lets the enqueue side cut that
//! idle wait short for priority 1 jobs. The `Reaper` sweeps abandoned leases
//! back to the queue every `lease_duration / 2`, which is what turns a
//! crashed worker into a redelivery instead of a lost job.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, DeliveryJob};
use tokio::sync::{futures::Notified, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{engine::EngineStats, error::Result, storage::JobStore};

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Signal from the enqueue side that an urgent job is waiting.
///
/// Clones share the same signal.
#[derive(Debug, Clone, Default)]
pub struct Wakeup {
    notify: Arc<Notify>,
}

impl Wakeup {
    /// Creates a new wake-up signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every worker currently waiting for work.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    /// Future that completes on the next `notify`.
    ///
    /// Call `enable` on the pinned future before checking for work so a
    /// notification sent in between is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// Leases due jobs for workers.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    batch_size: usize,
}

impl Scheduler {
    /// Creates a scheduler leasing up to `batch_size` jobs per call.
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        lease_duration: Duration,
        batch_size: usize,
    ) -> Self {
        Self { store, clock, lease_duration, batch_size }
    }

    /// Lease held by a worker before the reaper may reclaim the job.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Leases the next due jobs to `worker_id`, highest priority and oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the job store is unavailable.
    pub async fn lease_batch(&self, worker_id: &str) -> Result<Vec<DeliveryJob>> {
        let now = self.clock.now_utc();
        let jobs = self.store.lease(worker_id, self.batch_size, now, self.lease_duration).await?;

        if !jobs.is_empty() {
            debug!(worker_id, leased_count = jobs.len(), "leased jobs for delivery");
        }
        Ok(jobs)
    }
}

/// Background sweep returning expired leases to the queue.
pub struct Reaper {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
}

impl Reaper {
    /// Creates a reaper sweeping every half `lease_duration`, at most once
    /// per second.
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        lease_duration: Duration,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let interval = (lease_duration / 2).max(MIN_REAP_INTERVAL);
        Self { store, clock, interval, stats, cancellation_token }
    }

    /// Time between sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns every expired lease to the queue and reports how many were
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the job store is unavailable.
    pub async fn reap_once(&self) -> Result<usize> {
        let reclaimed = self.store.reap_expired(self.clock.now_utc()).await?;

        for job in &reclaimed {
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = job.attempts,
                "lease expired without an outcome, job returned to queue"
            );
        }

        if !reclaimed.is_empty() {
            let mut stats = self.stats.write().await;
            stats.leases_reclaimed += reclaimed.len() as u64;
        }

        Ok(reclaimed.len())
    }

    /// Sweeps until cancelled. Store failures are logged and the sweep is
    /// retried on the next tick.
    pub async fn run(&self) {
        info!(interval_seconds = self.interval.as_secs(), "lease reaper starting");

        loop {
            if let Err(error) = self.reap_once().await {
                error!(error = %error, "lease reaping failed");
            }

            tokio::select! {
                () = self.clock.sleep(self.interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!("lease reaper stopped");
    }
}
