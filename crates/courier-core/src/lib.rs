//! Core domain models, job state machine and persistence for courier.
//!
//! Every other crate builds on these types: the strongly-typed identifiers,
//! the unified `DeliveryJob` record that covers both email and webhook
//! deliveries, and the pure state transitions that both job stores share so
//! the in-memory and PostgreSQL implementations cannot drift apart.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptOutcome, DeliveryAttempt, DeliveryJob, Destination, EmailTemplate, EndpointId,
    Enqueued, JobFilter, JobId, JobKind, JobOutcome, JobPage, JobPayload, JobStatus, NewJob,
    QueueStats, TemplateValue, TemplateVariables, WebhookEndpoint,
};
pub use time::{Clock, RealClock, TestClock};
