//! Domain models, strongly-typed identifiers and the job state machine.
//!
//! `DeliveryJob` unifies outbound email and webhook deliveries into one
//! record. The transitions on it (`lease`, `apply_outcome`, `reclaim`,
//! `cancel`) are pure and are the only way job state changes, so every job
//! store applies exactly the same rules:
//!
//! ```text
//! queued --lease--> leased --sent--> sent
//!                          --retry (attempts < max)--> queued
//!                          --retry (attempts == max)--> dead
//!                          --permanent failure--> dead
//!        leased --lease expired--> queued   (attempts unchanged)
//! queued --cancel--> dead
//! ```
//!
//! A failed-but-retryable attempt is not a persisted status of its own; the
//! job returns to `queued` with a later `scheduled_for`.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Highest priority a job can carry. Enqueueing at this priority wakes idle
/// workers immediately.
pub const HIGHEST_PRIORITY: i16 = 1;

/// Lowest priority a job can carry.
pub const LOWEST_PRIORITY: i16 = 10;

/// Priority used when the caller does not supply one.
pub const DEFAULT_PRIORITY: i16 = 5;

/// Attempt ceiling used when the caller does not supply one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Reason recorded on jobs cancelled by an operator.
pub const CANCELLED_REASON: &str = "cancelled";

/// Strongly-typed delivery job identifier.
///
/// Sent to webhook receivers as the `delivery_id`, so receivers can dedupe
/// redeliveries of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed webhook endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a new random endpoint ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EndpointId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Transport a job is delivered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// SMTP delivery of a rendered template.
    Email,
    /// Signed HTTP POST to a subscriber endpoint.
    Webhook,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Webhook => write!(f, "webhook"),
        }
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(Self::Email),
            "webhook" => Ok(Self::Webhook),
            other => Err(CoreError::InvalidInput(format!("unknown job kind: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for JobKind {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobKind {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|_| format!("invalid job kind: {s}").into())
    }
}

/// Persisted lifecycle status of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be leased once `scheduled_for` has passed.
    Queued,
    /// Held by a worker until `leased_until`.
    Leased,
    /// Delivered. Terminal.
    #[serde(alias = "success")]
    Sent,
    /// Failed permanently, exhausted its attempts or was cancelled.
    /// Terminal until an operator retries it.
    Dead,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Queued, Self::Leased, Self::Sent, Self::Dead];

    /// Returns true for statuses no automatic process will leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Leased => write!(f, "leased"),
            Self::Sent => write!(f, "sent"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "sent" | "success" => Ok(Self::Sent),
            "dead" => Ok(Self::Dead),
            other => Err(CoreError::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|_| format!("invalid job status: {s}").into())
    }
}

/// Scalar template variable.
///
/// Only strings, numbers and booleans are accepted; objects, arrays and null
/// fail to deserialize so no structured or executable content reaches the
/// renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer or floating point number.
    Number(serde_json::Number),
    /// Text.
    Text(String),
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Variables substituted into an email template.
pub type TemplateVariables = BTreeMap<String, TemplateValue>;

/// Where a job is delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    /// Email recipient.
    Email {
        /// Validated recipient address.
        address: String,
        /// Optional display name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Webhook endpoint, resolved at send time.
    Webhook {
        /// Endpoint the request is posted to.
        endpoint_id: EndpointId,
    },
}

impl Destination {
    /// Transport this destination requires.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Email { .. } => JobKind::Email,
            Self::Webhook { .. } => JobKind::Webhook,
        }
    }
}

/// What a job delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Template name plus substitution variables.
    Email {
        /// Name of the template rendered at send time.
        template: String,
        /// Variables substituted into the template.
        #[serde(default)]
        variables: TemplateVariables,
    },
    /// Event type plus opaque JSON data.
    Webhook {
        /// Event type, sent as `X-Event-Type`.
        event_type: String,
        /// Payload placed under `data` in the request body.
        data: serde_json::Value,
    },
}

impl JobPayload {
    /// Transport this payload requires.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Email { .. } => JobKind::Email,
            Self::Webhook { .. } => JobKind::Webhook,
        }
    }
}

/// A job as submitted to `Enqueue`, before it has an id or timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Delivery destination.
    pub destination: Destination,
    /// Delivery payload.
    pub payload: JobPayload,
    /// 1 (highest) to 10 (lowest).
    pub priority: i16,
    /// Attempt ceiling.
    pub max_attempts: i32,
    /// Caller-supplied dedup key, unique per kind within the dedup window.
    pub idempotency_key: Option<String>,
    /// Dead job this job was created from by an operator retry.
    pub retried_from: Option<JobId>,
}

impl NewJob {
    /// Creates an email job with default priority and attempt ceiling.
    pub fn email(
        address: impl Into<String>,
        name: Option<String>,
        template: impl Into<String>,
        variables: TemplateVariables,
    ) -> Self {
        Self {
            destination: Destination::Email { address: address.into(), name },
            payload: JobPayload::Email { template: template.into(), variables },
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            idempotency_key: None,
            retried_from: None,
        }
    }

    /// Creates a webhook job for one endpoint.
    pub fn webhook(
        endpoint_id: EndpointId,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            destination: Destination::Webhook { endpoint_id },
            payload: JobPayload::Webhook { event_type: event_type.into(), data },
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            idempotency_key: None,
            retried_from: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Transport the job requires.
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Checks structural invariants that hold for every job.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&self.priority) {
            return Err(CoreError::InvalidInput(format!(
                "priority must be between {HIGHEST_PRIORITY} and {LOWEST_PRIORITY}, got {}",
                self.priority
            )));
        }
        if self.max_attempts < 1 {
            return Err(CoreError::InvalidInput("max_attempts must be at least 1".to_string()));
        }
        if self.destination.kind() != self.payload.kind() {
            return Err(CoreError::InvalidInput(format!(
                "{} destination cannot carry a {} payload",
                self.destination.kind(),
                self.payload.kind()
            )));
        }
        if self.idempotency_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            return Err(CoreError::InvalidInput("idempotency key must not be blank".to_string()));
        }
        Ok(())
    }

    /// Materializes the job in `queued` state, due immediately.
    pub fn into_job(self, now: DateTime<Utc>) -> DeliveryJob {
        DeliveryJob {
            id: JobId::new(),
            kind: self.kind(),
            destination: Json(self.destination),
            payload: Json(self.payload),
            status: JobStatus::Queued,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts,
            scheduled_for: now,
            leased_by: None,
            leased_until: None,
            last_error: None,
            idempotency_key: self.idempotency_key,
            retried_from: self.retried_from,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }
}

/// One unit of outbound work: one email or one webhook POST to one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    /// Unique identifier, immutable.
    pub id: JobId,
    /// Transport.
    pub kind: JobKind,
    /// Recipient or endpoint reference.
    pub destination: Json<Destination>,
    /// Template reference or event payload.
    pub payload: Json<JobPayload>,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Lower value is leased first.
    pub priority: i16,
    /// Delivery attempts made so far.
    pub attempts: i32,
    /// Attempt ceiling.
    pub max_attempts: i32,
    /// Not leased before this instant.
    pub scheduled_for: DateTime<Utc>,
    /// Worker holding the lease.
    pub leased_by: Option<String>,
    /// Lease expiry.
    pub leased_until: Option<DateTime<Utc>>,
    /// Failure reason of the most recent attempt.
    pub last_error: Option<String>,
    /// Caller-supplied dedup key.
    pub idempotency_key: Option<String>,
    /// Dead job this one was retried from.
    pub retried_from: Option<JobId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Successful delivery time.
    pub sent_at: Option<DateTime<Utc>>,
}

/// Result of a delivery attempt as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Transport accepted the delivery.
    Sent,
    /// Transient failure; retry at `scheduled_for` if attempts remain.
    Retry {
        /// Next eligible lease time.
        scheduled_for: DateTime<Utc>,
        /// Failure reason.
        error: String,
    },
    /// Permanent failure.
    Dead {
        /// Failure reason.
        error: String,
    },
}

impl DeliveryJob {
    /// Returns true when the job may be leased at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_for <= now
    }

    /// Returns true when the job is leased and the lease has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased && self.leased_until.is_none_or(|until| until <= now)
    }

    /// Number the next delivery attempt will carry (1-based).
    pub fn attempt_number(&self) -> i32 {
        self.attempts + 1
    }

    /// Endpoint a webhook job is delivered to.
    pub fn endpoint_id(&self) -> Option<EndpointId> {
        match &self.destination.0 {
            Destination::Webhook { endpoint_id } => Some(*endpoint_id),
            Destination::Email { .. } => None,
        }
    }

    /// Leases a queued job to `worker_id` until `now + lease_duration`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidState` unless the job is queued.
    pub fn lease(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<()> {
        if self.status != JobStatus::Queued {
            return Err(CoreError::InvalidState(format!(
                "job {} cannot be leased while {}",
                self.id, self.status
            )));
        }

        self.status = JobStatus::Leased;
        self.leased_by = Some(worker_id.to_string());
        self.leased_until = Some(now + to_chrono(lease_duration)?);
        self.updated_at = now;
        Ok(())
    }

    /// Applies a worker's outcome report.
    ///
    /// Every outcome consumes one attempt. A retry that would leave the job
    /// at its attempt ceiling dead-letters it instead.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the job is no longer leased by
    /// `worker_id`.
    pub fn apply_outcome(
        &mut self,
        worker_id: &str,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != JobStatus::Leased || self.leased_by.as_deref() != Some(worker_id) {
            return Err(CoreError::LeaseLost(format!(
                "job {} is {} and not leased by {worker_id}",
                self.id, self.status
            )));
        }

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.leased_by = None;
        self.leased_until = None;
        self.updated_at = now;

        match outcome {
            JobOutcome::Sent => {
                self.status = JobStatus::Sent;
                self.sent_at = Some(now);
                self.last_error = None;
            },
            JobOutcome::Retry { scheduled_for, error } => {
                self.last_error = Some(error.clone());
                if self.attempts >= self.max_attempts {
                    self.status = JobStatus::Dead;
                } else {
                    self.status = JobStatus::Queued;
                    self.scheduled_for = *scheduled_for;
                }
            },
            JobOutcome::Dead { error } => {
                self.status = JobStatus::Dead;
                self.last_error = Some(error.clone());
            },
        }
        Ok(())
    }

    /// Returns an abandoned lease to the queue without charging an attempt.
    ///
    /// Returns false, leaving the job untouched, unless the job is leased and
    /// its lease has expired at `now`.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> bool {
        if !self.lease_expired(now) {
            return false;
        }

        self.status = JobStatus::Queued;
        self.leased_by = None;
        self.leased_until = None;
        self.updated_at = now;
        true
    }

    /// Cancels a queued job by dead-lettering it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidState` unless the job is queued.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Queued {
            return Err(CoreError::InvalidState(format!(
                "job {} cannot be cancelled while {}",
                self.id, self.status
            )));
        }

        self.status = JobStatus::Dead;
        self.last_error = Some(CANCELLED_REASON.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Builds the fresh job an operator retry creates from this dead job.
    ///
    /// The copy keeps destination, payload, priority and attempt ceiling,
    /// starts at zero attempts and drops the idempotency key so it cannot
    /// collapse into the original.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidState` unless the job is dead.
    pub fn retry_copy(&self) -> Result<NewJob> {
        if self.status != JobStatus::Dead {
            return Err(CoreError::InvalidState(format!(
                "only dead jobs can be retried, job {} is {}",
                self.id, self.status
            )));
        }

        Ok(NewJob {
            destination: self.destination.0.clone(),
            payload: self.payload.0.clone(),
            priority: self.priority,
            max_attempts: self.max_attempts,
            idempotency_key: None,
            retried_from: Some(self.id),
        })
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| CoreError::InvalidInput(format!("duration out of range: {e}")))
}

/// Outcome class of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    /// Delivery accepted.
    Sent,
    /// Failed, retry eligible.
    Transient,
    /// Failed, never retried.
    Permanent,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptOutcome {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptOutcome {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "sent" => Ok(Self::Sent),
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            _ => Err(format!("invalid attempt outcome: {s}").into()),
        }
    }
}

/// Audit record of one transport call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier.
    pub id: Uuid,
    /// Job the attempt belongs to.
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt_number: i32,
    /// Worker that made the attempt.
    pub worker_id: String,
    /// Outcome class.
    pub outcome: AttemptOutcome,
    /// HTTP status or SMTP reply code, when the transport produced one.
    pub status_code: Option<i32>,
    /// Failure reason.
    pub error_message: Option<String>,
    /// Transport call duration.
    pub duration_ms: i64,
    /// When the attempt finished.
    pub attempted_at: DateTime<Utc>,
}

/// Email template, versioned by replacement.
///
/// Jobs render against the template's content at send time, so replacing a
/// template affects queued jobs that have not been sent yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailTemplate {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique name callers enqueue against.
    pub name: String,
    /// Subject line pattern.
    pub subject_pattern: String,
    /// Plain-text body pattern.
    pub body_text_pattern: Option<String>,
    /// HTML body pattern.
    pub body_html_pattern: Option<String>,
    /// Variables that must be present before a job is accepted.
    pub required_variables: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last replacement time.
    pub updated_at: DateTime<Utc>,
}

impl EmailTemplate {
    /// Creates a template.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when the name or subject is blank or
    /// neither body is present.
    pub fn new(
        name: impl Into<String>,
        subject_pattern: impl Into<String>,
        body_text_pattern: Option<String>,
        body_html_pattern: Option<String>,
        required_variables: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let template = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            subject_pattern: subject_pattern.into(),
            body_text_pattern,
            body_html_pattern,
            required_variables,
            created_at: now,
            updated_at: now,
        };
        template.validate()?;
        Ok(template)
    }

    /// Checks that the template can produce a message.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` describing the problem.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("template name must not be blank".to_string()));
        }
        if self.subject_pattern.trim().is_empty() {
            return Err(CoreError::InvalidInput("template subject must not be blank".to_string()));
        }
        if self.body_text_pattern.is_none() && self.body_html_pattern.is_none() {
            return Err(CoreError::InvalidInput(
                "template needs a text or HTML body".to_string(),
            ));
        }
        Ok(())
    }

    /// Required variables absent from `variables`.
    pub fn missing_variables(&self, variables: &TemplateVariables) -> Vec<String> {
        self.required_variables
            .iter()
            .filter(|name| !variables.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Subscriber endpoint for webhook events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEndpoint {
    /// Unique identifier.
    pub id: EndpointId,
    /// Human-readable name.
    pub name: String,
    /// URL requests are posted to.
    pub url: String,
    /// HMAC-SHA256 signing key.
    #[serde(skip_serializing)]
    pub secret_key: String,
    /// Event types this endpoint receives.
    pub subscribed_events: Vec<String>,
    /// Inactive endpoints receive nothing.
    pub is_active: bool,
    /// Per-request timeout.
    pub timeout_seconds: i32,
    /// Extra headers added to every request.
    pub custom_headers: Json<HashMap<String, String>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last replacement time.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Returns true when the endpoint is active and subscribed to `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.is_active && self.subscribed_events.iter().any(|event| event == event_type)
    }

    /// Request timeout, falling back to `default` when unset.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        u64::try_from(self.timeout_seconds)
            .ok()
            .filter(|seconds| *seconds > 0)
            .map_or(default, Duration::from_secs)
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new job row was written.
    Created(JobId),
    /// A job with the same kind and idempotency key already exists within
    /// the dedup window.
    Duplicate(JobId),
}

impl Enqueued {
    /// Id of the created or existing job.
    pub fn id(self) -> JobId {
        match self {
            Self::Created(id) | Self::Duplicate(id) => id,
        }
    }

    /// Returns true when no new row was written.
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Default page size for job listings.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest page size a listing will return.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Filter and page selection for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Only jobs of this kind.
    pub kind: Option<JobKind>,
    /// Only jobs created at or after this instant.
    pub created_from: Option<DateTime<Utc>>,
    /// Only jobs created before this instant.
    pub created_to: Option<DateTime<Utc>>,
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    /// Page size; 0 selects the default, larger than the maximum is capped.
    pub per_page: u32,
}

impl JobFilter {
    /// Effective 1-based page number.
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    /// Effective page size.
    pub fn per_page(&self) -> u32 {
        match self.per_page {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    /// Rows skipped before the selected page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.per_page())
    }

    /// Returns true when `job` passes every filter criterion.
    pub fn matches(&self, job: &DeliveryJob) -> bool {
        self.status.is_none_or(|status| job.status == status)
            && self.kind.is_none_or(|kind| job.kind == kind)
            && self.created_from.is_none_or(|from| job.created_at >= from)
            && self.created_to.is_none_or(|to| job.created_at < to)
    }
}

/// One page of a job listing, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    /// Jobs on this page.
    pub jobs: Vec<DeliveryJob>,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub per_page: u32,
    /// Jobs matching the filter across all pages.
    pub total: u64,
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to be leased.
    pub queued: u64,
    /// Jobs held by workers.
    pub leased: u64,
    /// Delivered jobs.
    pub sent: u64,
    /// Dead-lettered jobs.
    pub dead: u64,
}

impl QueueStats {
    /// Adds `count` jobs in `status`.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Leased => self.leased += count,
            JobStatus::Sent => self.sent += count,
            JobStatus::Dead => self.dead += count,
        }
    }

    /// Total jobs across all statuses.
    pub fn total(&self) -> u64 {
        self.queued + self.leased + self.sent + self.dead
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const LEASE: Duration = Duration::from_secs(300);

    fn queued_job(now: DateTime<Utc>) -> DeliveryJob {
        let mut variables = TemplateVariables::new();
        variables.insert("name".to_string(), "Jan".into());
        NewJob::email("jan@example.com", None, "welcome", variables).into_job(now)
    }

    fn leased_job(now: DateTime<Utc>) -> DeliveryJob {
        let mut job = queued_job(now);
        job.lease("worker-1", now, LEASE).unwrap();
        job
    }

    #[test]
    fn new_job_is_queued_and_due_immediately() {
        let now = Utc::now();
        let job = queued_job(now);

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.kind, JobKind::Email);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert!(job.is_due(now));
    }

    #[test]
    fn lease_sets_holder_and_expiry() {
        let now = Utc::now();
        let job = leased_job(now);

        assert_eq!(job.status, JobStatus::Leased);
        assert_eq!(job.leased_by.as_deref(), Some("worker-1"));
        assert_eq!(job.leased_until, Some(now + chrono::Duration::seconds(300)));
        assert!(!job.is_due(now));
    }

    #[test]
    fn leasing_a_leased_job_is_rejected() {
        let now = Utc::now();
        let mut job = leased_job(now);

        let result = job.lease("worker-2", now, LEASE);
        assert!(matches!(result, Err(CoreError::InvalidState(_))));
        assert_eq!(job.leased_by.as_deref(), Some("worker-1"));
    }

    #[test]
    fn success_marks_sent() {
        let now = Utc::now();
        let mut job = leased_job(now);

        job.apply_outcome("worker-1", &JobOutcome::Sent, now).unwrap();

        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.sent_at, Some(now));
        assert!(job.leased_by.is_none());
        assert!(job.leased_until.is_none());
    }

    #[test]
    fn transient_failure_requeues_until_ceiling() {
        let now = Utc::now();
        let mut job = leased_job(now);
        let retry_at = now + chrono::Duration::seconds(60);

        job.apply_outcome(
            "worker-1",
            &JobOutcome::Retry { scheduled_for: retry_at, error: "HTTP 500".to_string() },
            now,
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.scheduled_for, retry_at);
        assert_eq!(job.last_error.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn transient_failure_at_ceiling_dead_letters() {
        let now = Utc::now();
        let mut job = queued_job(now);
        job.max_attempts = 1;
        job.lease("worker-1", now, LEASE).unwrap();

        job.apply_outcome(
            "worker-1",
            &JobOutcome::Retry { scheduled_for: now, error: "timeout".to_string() },
            now,
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn permanent_failure_dead_letters() {
        let now = Utc::now();
        let mut job = leased_job(now);

        job.apply_outcome("worker-1", &JobOutcome::Dead { error: "HTTP 404".to_string() }, now)
            .unwrap();

        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.last_error.as_deref(), Some("HTTP 404"));
    }

    #[test]
    fn outcome_from_non_holder_is_rejected() {
        let now = Utc::now();
        let mut job = leased_job(now);

        let result = job.apply_outcome("worker-2", &JobOutcome::Sent, now);
        assert!(matches!(result, Err(CoreError::LeaseLost(_))));
        assert_eq!(job.status, JobStatus::Leased);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn reclaim_requires_expired_lease() {
        let now = Utc::now();
        let mut job = leased_job(now);

        assert!(!job.reclaim(now + chrono::Duration::seconds(299)));
        assert_eq!(job.status, JobStatus::Leased);

        assert!(job.reclaim(now + chrono::Duration::seconds(300)));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.leased_by.is_none());
    }

    #[test]
    fn cancel_only_from_queued() {
        let now = Utc::now();
        let mut queued = queued_job(now);
        queued.cancel(now).unwrap();
        assert_eq!(queued.status, JobStatus::Dead);
        assert_eq!(queued.last_error.as_deref(), Some(CANCELLED_REASON));

        let mut leased = leased_job(now);
        assert!(matches!(leased.cancel(now), Err(CoreError::InvalidState(_))));
    }

    #[test]
    fn retry_copy_links_to_dead_job() {
        let now = Utc::now();
        let mut job = leased_job(now);
        job.idempotency_key = Some("contact-42".to_string());
        job.apply_outcome("worker-1", &JobOutcome::Dead { error: "bounced".to_string() }, now)
            .unwrap();

        let copy = job.retry_copy().unwrap();

        assert_eq!(copy.retried_from, Some(job.id));
        assert_eq!(copy.idempotency_key, None);
        assert_eq!(copy.destination, job.destination.0);
        assert_eq!(copy.payload, job.payload.0);
        assert_eq!(copy.into_job(now).attempts, 0);
    }

    #[test]
    fn retry_copy_rejects_live_jobs() {
        let job = queued_job(Utc::now());
        assert!(matches!(job.retry_copy(), Err(CoreError::InvalidState(_))));
    }

    #[test]
    fn new_job_validation() {
        let valid = NewJob::webhook(EndpointId::new(), "article.published", json!({}));
        assert!(valid.validate().is_ok());

        assert!(valid.clone().with_priority(0).validate().is_err());
        assert!(valid.clone().with_priority(11).validate().is_err());
        assert!(valid.clone().with_max_attempts(0).validate().is_err());
        assert!(valid.clone().with_idempotency_key("  ").validate().is_err());

        let mut mismatched = valid;
        mismatched.payload =
            JobPayload::Email { template: "welcome".to_string(), variables: BTreeMap::new() };
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn template_values_reject_structured_content() {
        let scalars: TemplateVariables =
            serde_json::from_value(json!({"name": "Jan", "count": 3, "vip": true})).unwrap();
        assert_eq!(scalars.get("count"), Some(&TemplateValue::from(3)));
        assert_eq!(scalars.get("vip"), Some(&TemplateValue::Bool(true)));

        assert!(serde_json::from_value::<TemplateVariables>(json!({"x": {"y": 1}})).is_err());
        assert!(serde_json::from_value::<TemplateVariables>(json!({"x": [1]})).is_err());
        assert!(serde_json::from_value::<TemplateVariables>(json!({"x": null})).is_err());
    }

    #[test]
    fn status_parses_success_alias() {
        assert_eq!("success".parse::<JobStatus>().unwrap(), JobStatus::Sent);
        assert_eq!("dead".parse::<JobStatus>().unwrap(), JobStatus::Dead);
        assert!("failed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn missing_variables_reported() {
        let template = EmailTemplate::new(
            "welcome",
            "Welcome {{name}}",
            Some("Hi {{name}} from {{company}}".to_string()),
            None,
            vec!["name".to_string(), "company".to_string()],
            Utc::now(),
        )
        .unwrap();

        let mut variables = TemplateVariables::new();
        variables.insert("name".to_string(), "Jan".into());

        assert_eq!(template.missing_variables(&variables), vec!["company".to_string()]);
    }

    #[test]
    fn template_without_body_rejected() {
        let result = EmailTemplate::new("empty", "Subject", None, None, vec![], Utc::now());
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn filter_pagination_defaults_and_caps() {
        let filter = JobFilter::default();
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.per_page(), DEFAULT_PAGE_SIZE);
        assert_eq!(filter.offset(), 0);

        let filter = JobFilter { page: 3, per_page: 1000, ..Default::default() };
        assert_eq!(filter.per_page(), MAX_PAGE_SIZE);
        assert_eq!(filter.offset(), 400);
    }

    #[test]
    fn filter_matches_status_kind_and_range() {
        let now = Utc::now();
        let job = queued_job(now);

        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter { status: Some(JobStatus::Queued), ..Default::default() }.matches(&job));
        assert!(!JobFilter { kind: Some(JobKind::Webhook), ..Default::default() }.matches(&job));
        assert!(!JobFilter { created_to: Some(now), ..Default::default() }.matches(&job));
        assert!(JobFilter { created_from: Some(now), ..Default::default() }.matches(&job));
    }

    #[test]
    fn endpoint_timeout_falls_back() {
        let now = Utc::now();
        let mut endpoint = WebhookEndpoint {
            id: EndpointId::new(),
            name: "crm".to_string(),
            url: "https://crm.example.com/hooks".to_string(),
            secret_key: "secret".to_string(),
            subscribed_events: vec!["article.published".to_string()],
            is_active: true,
            timeout_seconds: 10,
            custom_headers: Json(HashMap::new()),
            created_at: now,
            updated_at: now,
        };

        assert_eq!(endpoint.timeout_or(Duration::from_secs(30)), Duration::from_secs(10));
        assert!(endpoint.subscribes_to("article.published"));
        assert!(!endpoint.subscribes_to("article.deleted"));

        endpoint.timeout_seconds = 0;
        endpoint.is_active = false;
        assert_eq!(endpoint.timeout_or(Duration::from_secs(30)), Duration::from_secs(30));
        assert!(!endpoint.subscribes_to("article.published"));
    }
}
