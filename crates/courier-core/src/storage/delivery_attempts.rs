//! Repository for delivery attempt history.
//!
//! Attempts are append-only. Each row is written in the same transaction as
//! the outcome report it describes, so history and job state never disagree.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryAttempt, JobId},
};

/// Repository for delivery attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Records a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, attempt: &DeliveryAttempt) -> Result<Uuid> {
        self.create_impl(&*self.pool, attempt).await
    }

    /// Records a delivery attempt within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<Uuid> {
        self.create_impl(&mut **tx, attempt).await
    }

    async fn create_impl<'e, E>(&self, executor: E, attempt: &DeliveryAttempt) -> Result<Uuid>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO delivery_attempts (
                id, job_id, attempt_number, worker_id, outcome,
                status_code, error_message, duration_ms, attempted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.job_id)
        .bind(attempt.attempt_number)
        .bind(&attempt.worker_id)
        .bind(attempt.outcome.to_string())
        .bind(attempt.status_code)
        .bind(&attempt.error_message)
        .bind(attempt.duration_ms)
        .bind(attempt.attempted_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds all attempts for a job in attempt order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_job(&self, job_id: JobId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, job_id, attempt_number, worker_id, outcome,
                   status_code, error_message, duration_ms, attempted_at
            FROM delivery_attempts
            WHERE job_id = $1
            ORDER BY attempt_number ASC, attempted_at ASC
            ",
        )
        .bind(job_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
