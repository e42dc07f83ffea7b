//! HTTP client for signed webhook delivery.
//!
//! Builds the POST for one job, enforces the per-endpoint timeout and maps
//! the response onto the failure classification: 2xx is delivered, 429 and
//! 5xx are transient, any other status is permanent.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use courier_core::JobId;
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_RECORDED_BODY_SIZE: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for endpoints that do not configure one.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: format!("courier-webhooks/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
        }
    }
}

/// One webhook POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Job being delivered, sent as `X-Delivery-Id`.
    pub delivery_id: JobId,
    /// Endpoint URL.
    pub url: String,
    /// Event type, sent as `X-Event-Type`.
    pub event_type: String,
    /// Signed JSON envelope.
    pub body: Bytes,
    /// `X-Signature` value.
    pub signature: String,
    /// 1-based attempt number, sent as `X-Delivery-Attempt`.
    pub attempt_number: i32,
    /// Endpoint custom headers.
    pub custom_headers: HashMap<String, String>,
    /// Request timeout.
    pub timeout: Duration,
}

/// Response from a successful webhook delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// HTTP client shared by all workers.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Default request timeout.
    pub fn default_timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Posts a signed webhook.
    ///
    /// # Errors
    ///
    /// - `NetworkError` for connection failures
    /// - `Timeout` when the endpoint does not answer within `request.timeout`
    /// - `RateLimited` for 429, carrying `Retry-After` when parseable
    /// - `ClientError` for other 4xx
    /// - `ServerError` for 5xx
    /// - `UnexpectedStatus` for anything else outside 2xx
    pub async fn deliver(&self, request: WebhookRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            event_type = %request.event_type,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self.client.post(&request.url).timeout(request.timeout);

            for (key, value) in &request.custom_headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            http_request = http_request
                .header("Content-Type", "application/json")
                .header("User-Agent", &self.config.user_agent)
                .header("X-Signature", &request.signature)
                .header("X-Event-Type", &request.event_type)
                .header("X-Delivery-Id", request.delivery_id.to_string())
                .header("X-Delivery-Attempt", request.attempt_number.to_string())
                .body(request.body.clone());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        error = %e,
                        "webhook request failed"
                    );

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let response = parse_response(response, start_time.elapsed()).await;

            tracing::debug!(
                status = response.status_code,
                duration_ms = response.duration.as_millis(),
                "received response"
            );

            classify(response)
        }
        .instrument(span)
        .await
    }
}

fn classify(response: DeliveryResponse) -> Result<DeliveryResponse> {
    match response.status_code {
        200..=299 => Ok(response),
        429 => {
            Err(DeliveryError::rate_limited(extract_retry_after_seconds(&response.headers)))
        },
        400..=499 => Err(DeliveryError::client_error(response.status_code, response.body)),
        500..=599 => Err(DeliveryError::server_error(response.status_code, response.body)),
        status_code => Err(DeliveryError::UnexpectedStatus { status_code }),
    }
}

async fn parse_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let suffix = "... (truncated)";
            let truncated = String::from_utf8_lossy(&bytes[..MAX_RECORDED_BODY_SIZE]);
            format!("{truncated}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, headers, body, duration }
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Headers set by the client itself, which endpoint custom headers cannot
/// override.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-type"
            | "content-length"
            | "host"
            | "user-agent"
            | "x-signature"
            | "x-event-type"
            | "x-delivery-id"
            | "x-delivery-attempt"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Extracts the retry-after delay from response headers.
///
/// Supports both delta-seconds and HTTP-date forms. Returns `None` when the
/// header is missing or unparseable, or names a time already past.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;
    let retry_after = retry_after.trim();

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(seconds);
    }

    let date_time = chrono::DateTime::parse_from_rfc2822(retry_after).ok()?;
    let delay = date_time.with_timezone(&chrono::Utc).signed_duration_since(chrono::Utc::now());
    delay.to_std().ok().map(|duration| duration.as_secs())
}
