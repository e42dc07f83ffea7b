//! Template rendering and webhook payload signing.
//!
//! Email templates are Handlebars patterns rendered in strict mode: a pattern
//! referencing a variable the job does not carry fails instead of rendering
//! an empty string. Subject and text bodies are rendered without escaping;
//! HTML bodies escape every substituted value.
//!
//! Webhook bodies are a fixed JSON envelope signed with HMAC-SHA256 over the
//! exact bytes sent.

use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use courier_core::{EmailTemplate, JobId, TemplateVariables};
use handlebars::Handlebars;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::error::RenderError;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the `X-Signature` header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Event types known to the default catalog.
pub const DEFAULT_EVENTS: [&str; 5] = [
    "article.published",
    "article.updated",
    "article.deleted",
    "contact.submitted",
    "analytics.rollup",
];

/// Rendered email content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
}

/// Renders email templates.
pub struct TemplateRenderer {
    plain: Handlebars<'static>,
    html: Handlebars<'static>,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Creates a renderer with strict variable checking.
    pub fn new() -> Self {
        let mut plain = Handlebars::new();
        plain.set_strict_mode(true);
        plain.register_escape_fn(handlebars::no_escape);

        let mut html = Handlebars::new();
        html.set_strict_mode(true);

        Self { plain, html }
    }

    /// Renders `template` with `variables`.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::MissingVariables` when a required variable is
    /// absent, and `RenderError::Malformed` when a pattern fails to parse or
    /// references a variable that is not supplied.
    pub fn render_email(
        &self,
        template: &EmailTemplate,
        variables: &TemplateVariables,
    ) -> Result<RenderedEmail, RenderError> {
        let missing = template.missing_variables(variables);
        if !missing.is_empty() {
            return Err(RenderError::MissingVariables(missing));
        }

        let malformed = |error: handlebars::RenderError| RenderError::Malformed {
            template: template.name.clone(),
            message: error.to_string(),
        };

        let subject =
            self.plain.render_template(&template.subject_pattern, variables).map_err(malformed)?;
        let text = template
            .body_text_pattern
            .as_deref()
            .map(|pattern| self.plain.render_template(pattern, variables))
            .transpose()
            .map_err(malformed)?;
        let html = template
            .body_html_pattern
            .as_deref()
            .map(|pattern| self.html.render_template(pattern, variables))
            .transpose()
            .map_err(malformed)?;

        Ok(RenderedEmail { subject: subject.trim().to_string(), text, html })
    }
}

/// Set of event types webhooks may be enqueued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCatalog {
    events: BTreeSet<String>,
}

impl Default for EventCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS)
    }
}

impl EventCatalog {
    /// Creates a catalog of the given event types.
    pub fn new<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { events: events.into_iter().map(Into::into).collect() }
    }

    /// Returns true if `event_type` is in the catalog.
    pub fn contains(&self, event_type: &str) -> bool {
        self.events.contains(event_type)
    }

    /// Event types in lexical order.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(String::as_str)
    }

    /// Checks that `event_type` is known.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::UnknownEvent` otherwise.
    pub fn validate(&self, event_type: &str) -> Result<(), RenderError> {
        if self.contains(event_type) {
            Ok(())
        } else {
            Err(RenderError::UnknownEvent(event_type.to_string()))
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a str,
    delivery_id: JobId,
    timestamp: String,
    data: &'a serde_json::Value,
}

/// Signed webhook request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedWebhook {
    /// JSON envelope bytes.
    pub body: Bytes,
    /// `X-Signature` header value.
    pub signature: String,
}

/// Builds and signs the request body for one webhook delivery.
///
/// The body is `{"event", "delivery_id", "timestamp", "data"}` with the
/// timestamp in RFC 3339 UTC.
///
/// # Errors
///
/// Returns `RenderError::Signature` if `secret` is empty.
pub fn render_webhook(
    delivery_id: JobId,
    event_type: &str,
    data: &serde_json::Value,
    secret: &str,
    timestamp: DateTime<Utc>,
) -> Result<RenderedWebhook, RenderError> {
    let envelope = Envelope {
        event: event_type,
        delivery_id,
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        data,
    };
    let body = serde_json::to_vec(&envelope).map_err(|e| RenderError::Payload(e.to_string()))?;
    let signature = sign_payload(secret, &body)?;

    Ok(RenderedWebhook { body: Bytes::from(body), signature })
}

/// Computes `sha256=<hex hmac>` of `body` keyed by `secret`.
///
/// # Errors
///
/// Returns `RenderError::Signature` if `secret` is empty.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, RenderError> {
    if secret.is_empty() {
        return Err(RenderError::Signature("endpoint has no signing secret".to_string()));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RenderError::Signature(e.to_string()))?;
    mac.update(body);

    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use courier_core::TemplateValue;
    use serde_json::json;

    use super::*;

    fn welcome_template() -> EmailTemplate {
        EmailTemplate::new(
            "welcome",
            "Welcome, {{name}}",
            Some("Hi {{name}}, thanks for joining.".to_string()),
            Some("<p>Hi {{name}}</p>".to_string()),
            vec!["name".to_string()],
            Utc::now(),
        )
        .unwrap()
    }

    fn variables(pairs: &[(&str, &str)]) -> TemplateVariables {
        pairs.iter().map(|(k, v)| ((*k).to_string(), TemplateValue::from(*v))).collect()
    }

    #[test]
    fn renders_subject_text_and_html() {
        let rendered = TemplateRenderer::new()
            .render_email(&welcome_template(), &variables(&[("name", "Jan")]))
            .unwrap();

        assert_eq!(rendered.subject, "Welcome, Jan");
        assert_eq!(rendered.text.as_deref(), Some("Hi Jan, thanks for joining."));
        assert_eq!(rendered.html.as_deref(), Some("<p>Hi Jan</p>"));
    }

    #[test]
    fn html_body_escapes_values_but_text_does_not() {
        let rendered = TemplateRenderer::new()
            .render_email(&welcome_template(), &variables(&[("name", "<b>Jan</b>")]))
            .unwrap();

        assert_eq!(rendered.text.as_deref(), Some("Hi <b>Jan</b>, thanks for joining."));
        assert_eq!(rendered.html.as_deref(), Some("<p>Hi &lt;b&gt;Jan&lt;/b&gt;</p>"));
    }

    #[test]
    fn missing_required_variable_reported() {
        let result = TemplateRenderer::new().render_email(&welcome_template(), &variables(&[]));
        assert_eq!(result, Err(RenderError::MissingVariables(vec!["name".to_string()])));
    }

    #[test]
    fn unlisted_but_referenced_variable_is_malformed() {
        let mut template = welcome_template();
        template.body_text_pattern = Some("Hi {{name}} from {{company}}".to_string());

        let result =
            TemplateRenderer::new().render_email(&template, &variables(&[("name", "Jan")]));
        assert!(matches!(result, Err(RenderError::Malformed { .. })));
    }

    #[test]
    fn numbers_and_booleans_render() {
        let mut template = welcome_template();
        template.body_text_pattern = Some("{{count}} new{{#if vip}} (vip){{/if}}".to_string());

        let mut vars = variables(&[("name", "Jan")]);
        vars.insert("count".to_string(), TemplateValue::from(3));
        vars.insert("vip".to_string(), TemplateValue::from(true));

        let rendered = TemplateRenderer::new().render_email(&template, &vars).unwrap();
        assert_eq!(rendered.text.as_deref(), Some("3 new (vip)"));
    }

    #[test]
    fn catalog_rejects_unknown_events() {
        let catalog = EventCatalog::default();

        assert!(catalog.validate("article.published").is_ok());
        assert_eq!(
            catalog.validate("article.archived"),
            Err(RenderError::UnknownEvent("article.archived".to_string()))
        );
    }

    #[test]
    fn webhook_envelope_shape() {
        let id = JobId::new();
        let rendered =
            render_webhook(id, "article.published", &json!({"slug": "hello"}), "secret", Utc::now())
                .unwrap();

        let body: serde_json::Value = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(body["event"], "article.published");
        assert_eq!(body["delivery_id"], id.to_string());
        assert_eq!(body["data"], json!({"slug": "hello"}));
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn signature_verifies_against_body() {
        let rendered =
            render_webhook(JobId::new(), "analytics.rollup", &json!([1, 2]), "k3y", Utc::now())
                .unwrap();

        let hex_part = rendered.signature.strip_prefix(SIGNATURE_PREFIX).unwrap();
        let mut mac = HmacSha256::new_from_slice(b"k3y").unwrap();
        mac.update(&rendered.body);
        mac.verify_slice(&hex::decode(hex_part).unwrap()).unwrap();
    }

    #[test]
    fn known_signature_vector() {
        // RFC 4231 test case 2.
        let signature = sign_payload("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn empty_secret_is_a_signature_error() {
        let result = render_webhook(JobId::new(), "article.updated", &json!({}), "", Utc::now());
        assert!(matches!(result, Err(RenderError::Signature(_))));
    }
}
