//! Repository for webhook endpoint operations.
//!
//! Endpoints are resolved at send time, so deactivating one or rotating its
//! secret takes effect for jobs already queued against it.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EndpointId, WebhookEndpoint},
};

const ENDPOINT_COLUMNS: &str = "id, name, url, secret_key, subscribed_events, is_active, \
                                timeout_seconds, custom_headers, created_at, updated_at";

/// Repository for webhook endpoint database operations.
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

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, endpoint_id: EndpointId) -> Result<Option<WebhookEndpoint>> {
        let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1");
        let endpoint = sqlx::query_as::<_, WebhookEndpoint>(&sql)
            .bind(endpoint_id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(endpoint)
    }

    /// Inserts an endpoint or replaces every mutable field of the existing
    /// one with the same id.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn upsert(&self, endpoint: &WebhookEndpoint) -> Result<WebhookEndpoint> {
        let sql = format!(
            r"
            INSERT INTO webhook_endpoints (
                id, name, url, secret_key, subscribed_events, is_active,
                timeout_seconds, custom_headers, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                secret_key = EXCLUDED.secret_key,
                subscribed_events = EXCLUDED.subscribed_events,
                is_active = EXCLUDED.is_active,
                timeout_seconds = EXCLUDED.timeout_seconds,
                custom_headers = EXCLUDED.custom_headers,
                updated_at = EXCLUDED.updated_at
            RETURNING {ENDPOINT_COLUMNS}
            "
        );

        let saved = sqlx::query_as::<_, WebhookEndpoint>(&sql)
            .bind(endpoint.id)
            .bind(&endpoint.name)
            .bind(&endpoint.url)
            .bind(&endpoint.secret_key)
            .bind(&endpoint.subscribed_events)
            .bind(endpoint.is_active)
            .bind(endpoint.timeout_seconds)
            .bind(&endpoint.custom_headers)
            .bind(endpoint.created_at)
            .bind(endpoint.updated_at)
            .fetch_one(&*self.pool)
            .await?;

        Ok(saved)
    }

    /// Finds active endpoints subscribed to `event_type`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_subscribed(&self, event_type: &str) -> Result<Vec<WebhookEndpoint>> {
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints \
             WHERE is_active AND $1 = ANY(subscribed_events) \
             ORDER BY created_at, id"
        );
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(&sql)
            .bind(event_type)
            .fetch_all(&*self.pool)
            .await?;
        Ok(endpoints)
    }

    /// Lists all endpoints, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self) -> Result<Vec<WebhookEndpoint>> {
        let sql =
            format!("SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints ORDER BY created_at, id");
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(&sql).fetch_all(&*self.pool).await?;
        Ok(endpoints)
    }
}
