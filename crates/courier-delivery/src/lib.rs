//! Delivery engine for transactional email and signed webhooks.
//!
//! Collaborators enqueue jobs through the [`Enqueuer`]; the
//! [`DeliveryEngine`] leases due jobs from the [`JobStore`], hands each to the
//! transport its kind requires and reports the outcome back. Every job is
//! delivered at least once: a worker that dies mid-delivery leaves a lease
//! behind that the reaper reclaims, and the job is attempted again.
//!
//! # Architecture
//!
//! Workers lease jobs with `FOR UPDATE SKIP LOCKED`, so any number of engine
//! processes can share one database without double-leasing. Each worker
//! handles the complete delivery lifecycle:
//!
//! 1. **Lease** - Claim the highest-priority due jobs, oldest first
//! 2. **Render** - Render the email template or sign the webhook body
//! 3. **Deliver** - One SMTP send or one HTTP POST, under a timeout
//! 4. **Report** - Mark sent, reschedule with backoff, or dead-letter
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, RealClock};
//! use courier_delivery::{
//!     DeliveryConfig, DeliveryEngine, DeliveryError, LogMailer, PostgresJobStore, Wakeup,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let store = Arc::new(PostgresJobStore::new(Arc::new(Storage::new(pool))));
//! let mut engine = DeliveryEngine::new(
//!     store,
//!     Arc::new(LogMailer),
//!     Wakeup::new(),
//!     DeliveryConfig::default(),
//!     Arc::new(RealClock::new()),
//! )?;
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod client;
pub mod dispatch;
pub mod engine;
pub mod enqueue;
pub mod error;
pub mod mailer;
pub mod render;
pub mod retry;
pub mod scheduler;
pub mod storage;
mod worker;
mod worker_pool;

pub use admin::{AdminService, JobDetail};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use enqueue::{EnqueueConfig, EnqueueEmail, EnqueueWebhook, Enqueuer};
pub use error::{AdminError, DeliveryError, EnqueueError, Result, ValidationError};
pub use mailer::{LogMailer, Mailer, SmtpConfig, SmtpMailer};
pub use render::EventCatalog;
pub use scheduler::Wakeup;
pub use storage::{InMemoryJobStore, JobStore, PostgresJobStore};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 8;

/// Default number of jobs a worker leases at once.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Default transport timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
