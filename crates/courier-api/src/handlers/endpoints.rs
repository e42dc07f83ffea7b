//! Webhook endpoint management.

use std::collections::HashMap;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    Json,
};
use courier_core::{EndpointId, WebhookEndpoint};
use serde::Deserialize;
use sqlx::types::Json as JsonColumn;
use tracing::instrument;
use uuid::Uuid;

use crate::{error::ApiError, AppState};

/// Body of `PUT /endpoints/{id}`.
#[derive(Debug, Deserialize)]
pub struct EndpointBody {
    /// Human-readable name.
    pub name: String,
    /// URL requests are posted to.
    pub url: String,
    /// HMAC-SHA256 signing key.
    pub secret_key: String,
    /// Event types the endpoint receives.
    pub subscribed_events: Vec<String>,
    /// Inactive endpoints receive nothing.
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Per-request timeout; the configured default applies when absent.
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
    /// Extra headers added to every request.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

fn default_active() -> bool {
    true
}

/// Creates or replaces the endpoint with the given id.
#[instrument(name = "put_endpoint", skip(state, id, body))]
pub async fn put_endpoint(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<EndpointBody>, JsonRejection>,
) -> Result<Json<WebhookEndpoint>, ApiError> {
    let Path(id) = id?;
    let Json(body) = body?;
    validate_endpoint(&state, &body)?;

    let now = state.clock.now_utc();
    let endpoint = WebhookEndpoint {
        id: EndpointId(id),
        name: body.name,
        url: body.url,
        secret_key: body.secret_key,
        subscribed_events: body.subscribed_events,
        is_active: body.is_active,
        timeout_seconds: body.timeout_seconds.unwrap_or(0),
        custom_headers: JsonColumn(body.custom_headers),
        created_at: now,
        updated_at: now,
    };

    Ok(Json(state.admin.save_endpoint(endpoint).await?))
}

/// Returns one endpoint; the signing key is never serialized.
#[instrument(name = "get_endpoint", skip(state, id))]
pub async fn get_endpoint(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<WebhookEndpoint>, ApiError> {
    let Path(id) = id?;
    state
        .admin
        .find_endpoint(EndpointId(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("endpoint {id} not found")))
}

fn validate_endpoint(state: &AppState, body: &EndpointBody) -> Result<(), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("endpoint name must not be blank".to_string()));
    }
    if !(body.url.starts_with("https://") || body.url.starts_with("http://")) {
        return Err(ApiError::Validation(format!("endpoint url must be http(s): {}", body.url)));
    }
    if body.secret_key.is_empty() {
        return Err(ApiError::Validation("endpoint secret_key must not be empty".to_string()));
    }
    if body.timeout_seconds.is_some_and(|seconds| seconds <= 0) {
        return Err(ApiError::Validation("timeout_seconds must be positive".to_string()));
    }

    let catalog = state.enqueuer.catalog();
    if let Some(unknown) = body.subscribed_events.iter().find(|event| !catalog.contains(event)) {
        return Err(ApiError::Validation(format!("unknown event type: {unknown}")));
    }
    Ok(())
}
