//! Error types for rendering, enqueueing and delivering jobs.
//!
//! `DeliveryError` carries the outcome of one transport attempt and decides
//! whether it is worth retrying. The remaining types are surfaced to callers:
//! `ValidationError` when an enqueue request is rejected before a job exists,
//! `AdminError` for operator actions on existing jobs.

use std::{fmt, time::Duration};

use courier_core::{CoreError, JobId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure of a single delivery attempt, or of the engine around it.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Transport call exceeded its timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the call timed out
        timeout_seconds: u64,
    },

    /// Webhook endpoint answered with a 4xx other than 429.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Webhook endpoint answered with a 5xx.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Webhook endpoint answered 429.
    #[error("rate limited: HTTP 429")]
    RateLimited {
        /// Parsed `Retry-After`, if the endpoint sent a usable one
        retry_after_seconds: Option<u64>,
    },

    /// Webhook endpoint answered with a status outside 2xx, 4xx and 5xx.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// Mail relay reported a temporary failure (SMTP 4xx).
    #[error("temporary SMTP failure: {message}")]
    SmtpTransient {
        /// SMTP reply code, if the relay sent one
        code: Option<u16>,
        /// Relay reply text
        message: String,
    },

    /// Mail relay rejected the message permanently (SMTP 5xx).
    #[error("permanent SMTP failure: {message}")]
    SmtpPermanent {
        /// SMTP reply code, if the relay sent one
        code: Option<u16>,
        /// Relay reply text
        message: String,
    },

    /// Recipient address cannot be delivered to.
    #[error("invalid recipient address: {address}")]
    InvalidRecipient {
        /// Offending address
        address: String,
    },

    /// Template or payload could not be rendered.
    #[error("render failed: {message}")]
    RenderError {
        /// Render error message
        message: String,
    },

    /// Webhook signature could not be computed.
    #[error("signature computation failed: {message}")]
    SignatureError {
        /// Signature error message
        message: String,
    },

    /// Webhook endpoint is missing, inactive or no longer subscribed.
    #[error("endpoint {endpoint_id} unavailable: {reason}")]
    EndpointUnavailable {
        /// Endpoint identifier
        endpoint_id: String,
        /// Why the endpoint cannot receive the job
        reason: String,
    },

    /// Job store operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid engine or transport configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Panic description
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with optional retry guidance.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates an invalid recipient error.
    pub fn invalid_recipient(address: impl Into<String>) -> Self {
        Self::InvalidRecipient { address: address.into() }
    }

    /// Creates a render error.
    pub fn render(message: impl Into<String>) -> Self {
        Self::RenderError { message: message.into() }
    }

    /// Creates an endpoint unavailable error.
    pub fn endpoint_unavailable(endpoint_id: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::EndpointUnavailable { endpoint_id: endpoint_id.to_string(), reason: reason.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Determines if this error represents a temporary failure that should be
    /// retried.
    ///
    /// Returns `true` for network errors, timeouts, 5xx responses, 429
    /// responses, temporary SMTP failures and database failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::SmtpTransient { .. }
            | Self::DatabaseError { .. } => true,

            Self::ClientError { .. }
            | Self::UnexpectedStatus { .. }
            | Self::SmtpPermanent { .. }
            | Self::InvalidRecipient { .. }
            | Self::RenderError { .. }
            | Self::SignatureError { .. }
            | Self::EndpointUnavailable { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }

    /// Classifies the error as transient or permanent.
    pub fn failure_class(&self) -> FailureClass {
        if self.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        }
    }

    /// Returns the delay requested by the endpoint, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// HTTP status or SMTP reply code carried by the error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. }
            | Self::ServerError { status_code, .. }
            | Self::UnexpectedStatus { status_code } => Some(*status_code),
            Self::RateLimited { .. } => Some(429),
            Self::SmtpTransient { code, .. } | Self::SmtpPermanent { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::database(error.to_string())
    }
}

impl From<RenderError> for DeliveryError {
    fn from(error: RenderError) -> Self {
        match error {
            RenderError::Signature(message) => Self::SignatureError { message },
            other => Self::render(other.to_string()),
        }
    }
}

/// Whether a failed attempt may succeed if repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to succeed on retry.
    Transient,
    /// Will never succeed without outside intervention.
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Template and payload rendering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// No template is stored under the name.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// Event type is not in the catalog.
    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    /// Required variables are absent.
    #[error("missing required variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    /// Template content failed to parse or render.
    #[error("template {template} failed to render: {message}")]
    Malformed {
        /// Template name
        template: String,
        /// Renderer message
        message: String,
    },

    /// Payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Payload(String),

    /// HMAC signature could not be computed.
    #[error("signature computation failed: {0}")]
    Signature(String),
}

/// Enqueue input rejected before any job was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No template is stored under the name.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// Event type is not in the catalog.
    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    /// Required template variables are absent.
    #[error("missing required variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    /// Recipient address does not parse.
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),

    /// Template renders with an error for the given variables.
    #[error("template does not render: {0}")]
    Render(String),

    /// Any other rejected field.
    #[error("{0}")]
    Invalid(String),
}

impl From<RenderError> for ValidationError {
    fn from(error: RenderError) -> Self {
        match error {
            RenderError::UnknownTemplate(name) => Self::UnknownTemplate(name),
            RenderError::UnknownEvent(event) => Self::UnknownEvent(event),
            RenderError::MissingVariables(names) => Self::MissingVariables(names),
            other => Self::Render(other.to_string()),
        }
    }
}

/// Failure of an enqueue call.
#[derive(Debug, Clone, Error)]
pub enum EnqueueError {
    /// Request was rejected; no job was created.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Job store was unavailable.
    #[error("job store error: {0}")]
    Store(CoreError),
}

impl From<CoreError> for EnqueueError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::Validation(ValidationError::Invalid(message)),
            other => Self::Store(other),
        }
    }
}

/// Failure of an operator action.
#[derive(Debug, Clone, Error)]
pub enum AdminError {
    /// No job has the id.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// Action is not valid in the job's current status.
    #[error("{0}")]
    InvalidState(String),

    /// Job store was unavailable.
    #[error("job store error: {0}")]
    Store(CoreError),
}

impl From<CoreError> for AdminError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidState(message) => Self::InvalidState(message),
            other => Self::Store(other),
        }
    }
}
