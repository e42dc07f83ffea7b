//! HTTP request handlers for the courier API.
//!
//! Handlers are grouped by functionality:
//! - `health` - Health check and readiness probes
//! - `jobs` - Job listing, detail, retry and cancel
//! - `enqueue` - Email and webhook enqueue for remote collaborators
//! - `templates` - Email template management
//! - `endpoints` - Webhook endpoint management
//!
//! Every handler fails with `ApiError`, rendered as a standard error body.

pub mod endpoints;
pub mod enqueue;
pub mod health;
pub mod jobs;
pub mod templates;

pub use endpoints::{get_endpoint, put_endpoint};
pub use enqueue::{enqueue_email, enqueue_webhook};
pub use health::{health_check, liveness_check, readiness_check};
pub use jobs::{cancel_job, get_job, list_jobs, queue_stats, retry_job};
pub use templates::{list_templates, put_template};
