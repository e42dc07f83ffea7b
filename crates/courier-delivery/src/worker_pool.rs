//! Worker pool management with structured concurrency.
//!
//! Spawns the delivery workers and the lease reaper as supervised tasks and
//! shuts them down together, bounded by a timeout.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    scheduler::Reaper,
    worker::{DeliveryWorker, WorkerContext},
};

/// Worker pool that manages delivery worker tasks with supervision.
pub struct WorkerPool {
    context: WorkerContext,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    reaper_handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(context: WorkerContext) -> Self {
        Self { context, worker_handles: Vec::new(), reaper_handle: None }
    }

    /// Spawns all configured workers plus the reaper and returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the pool was already
    /// started.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(DeliveryError::configuration("worker pool already started"));
        }

        let worker_count = self.context.config.worker_count;
        info!(worker_count, "spawning delivery workers");

        {
            let mut stats = self.context.stats.write().await;
            stats.active_workers = worker_count;
        }

        for worker_id in 0..worker_count {
            let worker = DeliveryWorker::new(worker_id, self.context.clone());

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id,
                        error = %error,
                        "delivery worker terminated with error"
                    );
                } else {
                    info!(worker_id, "delivery worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        let reaper = Reaper::new(
            self.context.store.clone(),
            self.context.clock.clone(),
            self.context.config.lease_duration,
            self.context.stats.clone(),
            self.context.cancellation_token.clone(),
        );
        self.reaper_handle = Some(tokio::spawn(async move { reaper.run().await }));

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");
        Ok(())
    }

    /// Cancels all tasks and waits for in-flight deliveries to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the tasks do not finish
    /// within `timeout`, and `DeliveryError::WorkerPanic` for the first worker
    /// that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.context.cancellation_token.cancel();

        let worker_handles = std::mem::take(&mut self.worker_handles);
        let reaper_handle = self.reaper_handle.take();
        let stats = self.context.stats.clone();

        let shutdown_future = async move {
            let mut first_panic = None;

            for (worker_id, handle) in worker_handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id,
                            error = %error,
                            "worker completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            if let Some(handle) = reaper_handle {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "lease reaper panicked during shutdown");
                }
            }

            {
                let mut stats = stats.write().await;
                stats.active_workers = 0;
            }

            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns true while any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Number of spawned workers.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.context.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.context.cancellation_token.cancel();
            warn!("call shutdown_graceful() before dropping the worker pool");
        }
    }
}
