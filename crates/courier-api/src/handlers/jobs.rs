//! Admin handlers for inspecting and intervening on delivery jobs.

use std::{fmt, str::FromStr};

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{DeliveryJob, JobFilter, JobId, JobKind, JobPage, JobStatus, QueueStats};
use courier_delivery::JobDetail;
use serde::{de, Deserialize, Deserializer, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{error::ApiError, AppState};

/// Query string accepted by `GET /jobs`.
///
/// A parameter that is present but empty (`?status=`) is treated as absent.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// Only jobs in this status.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub status: Option<JobStatus>,
    /// Only jobs of this kind.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub kind: Option<JobKind>,
    /// Only jobs created at or after this instant.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub created_from: Option<DateTime<Utc>>,
    /// Only jobs created before this instant.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub created_to: Option<DateTime<Utc>>,
    /// 1-based page number.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub page: Option<u32>,
    /// Page size.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub per_page: Option<u32>,
}

fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match Option::<String>::deserialize(deserializer)?.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(de::Error::custom),
    }
}

impl From<ListJobsQuery> for JobFilter {
    fn from(query: ListJobsQuery) -> Self {
        Self {
            status: query.status,
            kind: query.kind,
            created_from: query.created_from,
            created_to: query.created_to,
            page: query.page.unwrap_or(1),
            per_page: query.per_page.unwrap_or(0),
        }
    }
}

/// Response of an operator retry.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    /// Job that will carry the retried delivery.
    pub job_id: JobId,
    /// Dead job the retry was requested for.
    pub retried_from: JobId,
    /// True when an earlier retry already created `job_id`.
    pub duplicate: bool,
}

/// Lists jobs, newest first, filtered by status, kind and creation range.
#[instrument(name = "list_jobs", skip(state, query))]
pub async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<JobPage>, ApiError> {
    let Query(query) = query?;
    let filter = JobFilter::from(query);
    let page = state.admin.list(&filter).await?;
    Ok(Json(page))
}

/// Returns one job with its attempt history.
#[instrument(name = "get_job", skip(state, id))]
pub async fn get_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<JobDetail>, ApiError> {
    let Path(id) = id?;
    let detail = state.admin.get(JobId(id)).await?;
    Ok(Json(detail))
}

/// Re-enqueues a dead job as a fresh job.
///
/// Answers `201 Created` for a new job and `200 OK` when an earlier retry of
/// the same dead job already created one.
#[instrument(name = "retry_job", skip(state, id))]
pub async fn retry_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = id?;
    let dead = JobId(id);
    let enqueued = state.admin.retry(dead).await?;

    let status = if enqueued.is_duplicate() { StatusCode::OK } else { StatusCode::CREATED };
    let body = RetryResponse {
        job_id: enqueued.id(),
        retried_from: dead,
        duplicate: enqueued.is_duplicate(),
    };
    Ok((status, Json(body)).into_response())
}

/// Cancels a queued job.
#[instrument(name = "cancel_job", skip(state, id))]
pub async fn cancel_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<DeliveryJob>, ApiError> {
    let Path(id) = id?;
    let job = state.admin.cancel(JobId(id)).await?;
    info!(job_id = %job.id, "job cancelled through admin API");
    Ok(Json(job))
}

/// Job counts per status.
#[instrument(name = "queue_stats", skip(state))]
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.admin.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_defaults_to_first_page() {
        let filter = JobFilter::from(ListJobsQuery::default());

        assert_eq!(filter.page(), 1);
        assert_eq!(filter.per_page(), courier_core::models::DEFAULT_PAGE_SIZE);
        assert!(filter.status.is_none());
    }

    #[test]
    fn query_carries_filters() {
        let query = ListJobsQuery {
            status: Some(JobStatus::Dead),
            kind: Some(JobKind::Webhook),
            page: Some(3),
            per_page: Some(10),
            ..ListJobsQuery::default()
        };

        let filter = JobFilter::from(query);

        assert_eq!(filter.status, Some(JobStatus::Dead));
        assert_eq!(filter.kind, Some(JobKind::Webhook));
        assert_eq!(filter.offset(), 20);
    }

    fn parse(uri: &str) -> Result<ListJobsQuery, QueryRejection> {
        let uri: axum::http::Uri = uri.parse().unwrap();
        Query::try_from_uri(&uri).map(|Query(query)| query)
    }

    #[test]
    fn empty_parameters_are_ignored() {
        let query = parse("/jobs?status=&kind=&page=&per_page=&created_from=").unwrap();

        assert!(query.status.is_none());
        assert!(query.kind.is_none());
        assert!(query.page.is_none());
        assert!(query.created_from.is_none());
        assert_eq!(JobFilter::from(query).page(), 1);
    }

    #[test]
    fn present_parameters_are_parsed() {
        let query = parse("/jobs?status=success&kind=email&page=2&created_to=2026-01-01T00:00:00Z")
            .unwrap();

        assert_eq!(query.status, Some(JobStatus::Sent));
        assert_eq!(query.kind, Some(JobKind::Email));
        assert_eq!(query.page, Some(2));
        assert!(query.created_to.is_some());
        assert!(parse("/jobs?status=exploded").is_err());
        assert!(parse("/jobs?page=two").is_err());
    }
}
