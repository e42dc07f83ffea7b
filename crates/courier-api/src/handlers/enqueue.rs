//! Enqueue handlers for collaborators running in other processes.
//!
//! Same semantics as the in-process `Enqueuer`: validation failures come back
//! at once with no job created, accepted requests return job ids without
//! waiting on delivery.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::{Enqueued, JobId};
use courier_delivery::{EnqueueEmail, EnqueueWebhook};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::ApiError, AppState};

/// One accepted job.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueuedJob {
    /// Id of the created or existing job.
    pub job_id: JobId,
    /// True when the idempotency key matched an existing job.
    pub duplicate: bool,
}

impl From<Enqueued> for EnqueuedJob {
    fn from(enqueued: Enqueued) -> Self {
        Self { job_id: enqueued.id(), duplicate: enqueued.is_duplicate() }
    }
}

/// Response of a webhook enqueue: one job per subscribed endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueuedWebhooks {
    /// Jobs in endpoint order; empty when no endpoint subscribes.
    pub jobs: Vec<EnqueuedJob>,
}

/// Enqueues one templated email.
///
/// Answers `202 Accepted` for a new job and `200 OK` for a duplicate.
#[instrument(name = "enqueue_email", skip(state, request))]
pub async fn enqueue_email(
    State(state): State<AppState>,
    request: Result<Json<EnqueueEmail>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let enqueued = state.enqueuer.enqueue_email(request).await?;

    let status = if enqueued.is_duplicate() { StatusCode::OK } else { StatusCode::ACCEPTED };
    Ok((status, Json(EnqueuedJob::from(enqueued))).into_response())
}

/// Publishes one event to every subscribed endpoint.
#[instrument(name = "enqueue_webhook", skip(state, request))]
pub async fn enqueue_webhook(
    State(state): State<AppState>,
    request: Result<Json<EnqueueWebhook>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let enqueued = state.enqueuer.enqueue_webhook(request).await?;

    let jobs: Vec<EnqueuedJob> = enqueued.into_iter().map(EnqueuedJob::from).collect();
    Ok((StatusCode::ACCEPTED, Json(EnqueuedWebhooks { jobs })).into_response())
}
