//! Idempotent schema bootstrap.
//!
//! Applied at startup; every statement is safe to re-run against an
//! existing database.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "email_templates",
        r#"
        CREATE TABLE IF NOT EXISTS email_templates (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            subject_pattern TEXT NOT NULL,
            body_text_pattern TEXT,
            body_html_pattern TEXT,
            required_variables TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK (body_text_pattern IS NOT NULL OR body_html_pattern IS NOT NULL)
        )
        "#,
    ),
    (
        "webhook_endpoints",
        r#"
        CREATE TABLE IF NOT EXISTS webhook_endpoints (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            secret_key TEXT NOT NULL,
            subscribed_events TEXT[] NOT NULL DEFAULT '{}',
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            timeout_seconds INTEGER NOT NULL DEFAULT 30,
            custom_headers JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "delivery_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_jobs (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('email', 'webhook')),
            destination JSONB NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('queued', 'leased', 'sent', 'dead')),
            priority SMALLINT NOT NULL DEFAULT 5 CHECK (priority BETWEEN 1 AND 10),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
            scheduled_for TIMESTAMPTZ NOT NULL,
            leased_by TEXT,
            leased_until TIMESTAMPTZ,
            last_error TEXT,
            idempotency_key TEXT,
            retried_from UUID REFERENCES delivery_jobs(id),
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            sent_at TIMESTAMPTZ,
            CHECK (attempts BETWEEN 0 AND max_attempts),
            CHECK (status <> 'leased' OR (leased_by IS NOT NULL AND leased_until IS NOT NULL))
        )
        "#,
    ),
    (
        "delivery_attempts",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES delivery_jobs(id),
            attempt_number INTEGER NOT NULL,
            worker_id TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK (outcome IN ('sent', 'transient', 'permanent')),
            status_code INTEGER,
            error_message TEXT,
            duration_ms BIGINT NOT NULL,
            attempted_at TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "idx_delivery_jobs_due",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_due
        ON delivery_jobs(priority, created_at)
        WHERE status = 'queued'
        "#,
    ),
    (
        "idx_delivery_jobs_lease",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_lease
        ON delivery_jobs(leased_until)
        WHERE status = 'leased'
        "#,
    ),
    (
        "idx_delivery_jobs_idempotency",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_idempotency
        ON delivery_jobs(kind, idempotency_key, created_at DESC)
        WHERE idempotency_key IS NOT NULL
        "#,
    ),
    (
        "idx_delivery_jobs_created",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_jobs_created
        ON delivery_jobs(created_at DESC)
        "#,
    ),
    (
        "idx_delivery_jobs_retried_from",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_delivery_jobs_retried_from
        ON delivery_jobs(retried_from)
        WHERE retried_from IS NOT NULL
        "#,
    ),
    (
        "idx_delivery_attempts_job",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_job
        ON delivery_attempts(job_id, attempt_number)
        "#,
    ),
];

/// Creates all tables and indexes that do not exist yet.
///
/// # Errors
///
/// Returns the first failing statement's error; statements before it stay
/// applied.
pub async fn apply(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        debug!(object = name, "applying schema statement");
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
