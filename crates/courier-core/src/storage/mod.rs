//! PostgreSQL repositories for delivery jobs, templates, endpoints and
//! attempt history.
//!
//! Repositories translate between domain models and rows and own every SQL
//! statement in the system. Operations that must be atomic with others
//! expose `*_in_tx` variants taking an open transaction.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

pub mod delivery_attempts;
pub mod endpoints;
pub mod jobs;
pub mod schema;
pub mod templates;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<PgPool>,

    /// Repository for delivery jobs.
    pub jobs: Arc<jobs::Repository>,

    /// Repository for email templates.
    pub templates: Arc<templates::Repository>,

    /// Repository for webhook endpoints.
    pub endpoints: Arc<endpoints::Repository>,

    /// Repository for delivery attempt history.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            jobs: Arc::new(jobs::Repository::new(pool.clone())),
            templates: Arc::new(templates::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Starts a transaction on the shared pool.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if no connection can be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Round-trips a trivial query to verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_lazily() {
        let pool = PgPool::connect_lazy("postgresql://localhost/courier_test").unwrap();
        let storage = Storage::new(pool);
        assert!(Arc::ptr_eq(&storage.pool(), &storage.pool));
    }
}
