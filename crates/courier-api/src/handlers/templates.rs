//! Email template management.
//!
//! Templates are versioned by replacement: a `PUT` overwrites the content
//! under the name, and queued jobs render with whatever is stored when they
//! are sent.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use courier_core::EmailTemplate;
use serde::Deserialize;
use tracing::instrument;

use crate::{error::ApiError, AppState};

/// Body of `PUT /templates/{name}`.
#[derive(Debug, Deserialize)]
pub struct TemplateBody {
    /// Subject pattern.
    pub subject: String,
    /// Plain-text body pattern.
    #[serde(default)]
    pub body_text: Option<String>,
    /// HTML body pattern.
    #[serde(default)]
    pub body_html: Option<String>,
    /// Variables every enqueue must supply.
    #[serde(default)]
    pub required_variables: Vec<String>,
}

/// Creates or replaces the template stored under `name`.
#[instrument(name = "put_template", skip(state, body))]
pub async fn put_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<TemplateBody>, JsonRejection>,
) -> Result<Json<EmailTemplate>, ApiError> {
    let Json(body) = body?;
    let template = EmailTemplate::new(
        name,
        body.subject,
        body.body_text,
        body.body_html,
        body.required_variables,
        state.clock.now_utc(),
    )?;

    Ok(Json(state.admin.save_template(template).await?))
}

/// Lists every stored template by name.
#[instrument(name = "list_templates", skip(state))]
pub async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<Vec<EmailTemplate>>, ApiError> {
    Ok(Json(state.admin.list_templates().await?))
}
