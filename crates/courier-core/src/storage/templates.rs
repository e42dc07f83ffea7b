//! Repository for email template operations.
//!
//! Templates are keyed by name. Saving a template under an existing name
//! replaces its content in place; queued jobs pick up the new content when
//! they are rendered at send time.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{error::Result, models::EmailTemplate};

const TEMPLATE_COLUMNS: &str = "id, name, subject_pattern, body_text_pattern, body_html_pattern, \
                                required_variables, created_at, updated_at";

/// Repository for email template database operations.
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

    /// Finds a template by its unique name.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<EmailTemplate>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE name = $1");
        let template =
            sqlx::query_as::<_, EmailTemplate>(&sql).bind(name).fetch_optional(&*self.pool).await?;
        Ok(template)
    }

    /// Inserts a template or replaces the content of the one with the same
    /// name. The stored row keeps its original id and creation time.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails or a constraint is violated.
    pub async fn upsert(&self, template: &EmailTemplate) -> Result<EmailTemplate> {
        let sql = format!(
            r"
            INSERT INTO email_templates (
                id, name, subject_pattern, body_text_pattern, body_html_pattern,
                required_variables, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO UPDATE SET
                subject_pattern = EXCLUDED.subject_pattern,
                body_text_pattern = EXCLUDED.body_text_pattern,
                body_html_pattern = EXCLUDED.body_html_pattern,
                required_variables = EXCLUDED.required_variables,
                updated_at = EXCLUDED.updated_at
            RETURNING {TEMPLATE_COLUMNS}
            "
        );

        let saved = sqlx::query_as::<_, EmailTemplate>(&sql)
            .bind(template.id)
            .bind(&template.name)
            .bind(&template.subject_pattern)
            .bind(&template.body_text_pattern)
            .bind(&template.body_html_pattern)
            .bind(&template.required_variables)
            .bind(template.created_at)
            .bind(template.updated_at)
            .fetch_one(&*self.pool)
            .await?;

        Ok(saved)
    }

    /// Lists all templates ordered by name.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self) -> Result<Vec<EmailTemplate>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates ORDER BY name");
        let templates = sqlx::query_as::<_, EmailTemplate>(&sql).fetch_all(&*self.pool).await?;
        Ok(templates)
    }

    /// Finds a template by name within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_name_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
    ) -> Result<Option<EmailTemplate>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE name = $1");
        let template =
            sqlx::query_as::<_, EmailTemplate>(&sql).bind(name).fetch_optional(&mut **tx).await?;
        Ok(template)
    }
}
