//! Repository for delivery job rows.
//!
//! Leasing and lease reclamation are single `UPDATE ... WHERE id IN (SELECT
//! ... FOR UPDATE SKIP LOCKED)` statements, so concurrent workers on any
//! number of hosts never receive the same row. Idempotent enqueue and
//! outcome reports are composed from the `*_in_tx` primitives by the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{DeliveryJob, JobFilter, JobId, JobKind, JobPage, JobStatus, QueueStats},
};

const JOB_COLUMNS: &str = "id, kind, destination, payload, status, priority, attempts, \
                           max_attempts, scheduled_for, leased_by, leased_until, last_error, \
                           idempotency_key, retried_from, created_at, updated_at, sent_at";

/// Repository for delivery job database operations.
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

    /// Inserts a new job.
    ///
    /// # Errors
    ///
    /// Returns error if the insert violates a constraint or the database is
    /// unavailable.
    pub async fn insert(&self, job: &DeliveryJob) -> Result<JobId> {
        self.insert_impl(&*self.pool, job).await
    }

    /// Inserts a new job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &DeliveryJob,
    ) -> Result<JobId> {
        self.insert_impl(&mut **tx, job).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, job: &DeliveryJob) -> Result<JobId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO delivery_jobs (
                id, kind, destination, payload, status, priority, attempts, max_attempts,
                scheduled_for, leased_by, leased_until, last_error, idempotency_key,
                retried_from, created_at, updated_at, sent_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
            )
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(job.kind.to_string())
        .bind(&job.destination)
        .bind(&job.payload)
        .bind(job.status.to_string())
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.scheduled_for)
        .bind(&job.leased_by)
        .bind(job.leased_until)
        .bind(&job.last_error)
        .bind(&job.idempotency_key)
        .bind(job.retried_from)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.sent_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a job by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = $1");
        let job =
            sqlx::query_as::<_, DeliveryJob>(&sql).bind(id).fetch_optional(&*self.pool).await?;
        Ok(job)
    }

    /// Loads a job and locks its row until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_for_update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<Option<DeliveryJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = $1 FOR UPDATE");
        let job = sqlx::query_as::<_, DeliveryJob>(&sql).bind(id).fetch_optional(&mut **tx).await?;
        Ok(job)
    }

    /// Serializes concurrent enqueues of the same `(kind, key)` pair.
    ///
    /// Takes a transaction-scoped advisory lock, released on commit or
    /// rollback. Two requests racing with the same key therefore perform
    /// their duplicate check and insert one after the other.
    ///
    /// # Errors
    ///
    /// Returns error if the lock query fails.
    pub async fn lock_idempotency_key_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        kind: JobKind,
        key: &str,
    ) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{kind}:{key}"))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Finds the newest job with the same kind and idempotency key created at
    /// or after `since`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_duplicate_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        kind: JobKind,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<JobId>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT id FROM delivery_jobs
            WHERE kind = $1 AND idempotency_key = $2 AND created_at >= $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(kind.to_string())
        .bind(key)
        .bind(since)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Finds the job an operator retry already created from `original`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_retry_of_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        original: JobId,
    ) -> Result<Option<JobId>> {
        let id = sqlx::query_scalar("SELECT id FROM delivery_jobs WHERE retried_from = $1")
            .bind(original)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(id)
    }

    /// Leases up to `batch_size` due jobs to `worker_id`.
    ///
    /// Selects queued jobs with `scheduled_for <= now` in `(priority,
    /// created_at)` order, skipping rows locked by concurrent leasers, and
    /// marks them leased until `leased_until` in the same statement. The
    /// returned batch is in lease order.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn lease_due(
        &self,
        worker_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        leased_until: DateTime<Utc>,
    ) -> Result<Vec<DeliveryJob>> {
        let limit = i64::try_from(batch_size)
            .map_err(|_| CoreError::InvalidInput(format!("batch size {batch_size} too large")))?;

        let sql = format!(
            r#"
            UPDATE delivery_jobs
            SET status = 'leased', leased_by = $1, leased_until = $2, updated_at = $3
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE status = 'queued' AND scheduled_for <= $3
                ORDER BY priority ASC, created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let mut jobs = sqlx::query_as::<_, DeliveryJob>(&sql)
            .bind(worker_id)
            .bind(leased_until)
            .bind(now)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        // RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| (a.priority, a.created_at).cmp(&(b.priority, b.created_at)));
        Ok(jobs)
    }

    /// Writes back the mutable state of a job.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the row does not exist.
    pub async fn update_state_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &DeliveryJob,
    ) -> Result<()> {
        self.update_state_impl(&mut **tx, job).await
    }

    /// Writes back the mutable state of a job outside a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the row does not exist.
    pub async fn update_state(&self, job: &DeliveryJob) -> Result<()> {
        self.update_state_impl(&*self.pool, job).await
    }

    async fn update_state_impl<'e, E>(&self, executor: E, job: &DeliveryJob) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = $2, attempts = $3, scheduled_for = $4, leased_by = $5,
                leased_until = $6, last_error = $7, updated_at = $8, sent_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.to_string())
        .bind(job.attempts)
        .bind(job.scheduled_for)
        .bind(&job.leased_by)
        .bind(job.leased_until)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .bind(job.sent_at)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("job {} not found", job.id)));
        }
        Ok(())
    }

    /// Returns every leased job whose lease expired at or before `now` to
    /// the queue, leaving `attempts` unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryJob>> {
        let sql = format!(
            r#"
            UPDATE delivery_jobs
            SET status = 'queued', leased_by = NULL, leased_until = NULL, updated_at = $1
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE status = 'leased' AND leased_until <= $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let jobs = sqlx::query_as::<_, DeliveryJob>(&sql).bind(now).fetch_all(&*self.pool).await?;
        Ok(jobs)
    }

    /// Lists jobs matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        const WHERE_CLAUSE: &str = r#"
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at < $4)
        "#;

        let status = filter.status.map(|s| s.to_string());
        let kind = filter.kind.map(|k| k.to_string());
        let limit = i64::from(filter.per_page());
        let offset = i64::try_from(filter.offset())
            .map_err(|_| CoreError::InvalidInput("page out of range".to_string()))?;

        let count_sql = format!("SELECT COUNT(*) FROM delivery_jobs {WHERE_CLAUSE}");
        let total: i64 = sqlx::query_scalar(&count_sql)
            .bind(&status)
            .bind(&kind)
            .bind(filter.created_from)
            .bind(filter.created_to)
            .fetch_one(&*self.pool)
            .await?;

        let list_sql = format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs {WHERE_CLAUSE} \
             ORDER BY created_at DESC, id ASC LIMIT $5 OFFSET $6"
        );
        let jobs = sqlx::query_as::<_, DeliveryJob>(&list_sql)
            .bind(&status)
            .bind(&kind)
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.pool)
            .await?;

        Ok(JobPage {
            jobs,
            page: filter.page(),
            per_page: filter.per_page(),
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    /// Counts jobs per status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self) -> Result<QueueStats> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM delivery_jobs GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}
