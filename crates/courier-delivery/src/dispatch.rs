//! Resolves a leased job into one transport call.
//!
//! Templates and endpoints are read at send time, so a template replaced
//! after enqueue renders with its current content and a deactivated endpoint
//! stops receiving. Rendering and signing happen here, immediately before
//! the call, and never again for the same attempt.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, DeliveryJob, Destination, EndpointId, JobPayload, TemplateVariables};
use tracing::debug;

use crate::{
    client::{WebhookClient, WebhookRequest},
    error::{DeliveryError, RenderError, Result},
    mailer::{Mailer, OutgoingEmail},
    render::{render_webhook, TemplateRenderer},
    storage::JobStore,
};

/// Transport acknowledgement of a delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// HTTP status or SMTP reply code.
    pub status_code: Option<u16>,
}

/// Delivers jobs over the transport their kind requires.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    renderer: Arc<TemplateRenderer>,
    mailer: Arc<dyn Mailer>,
    client: Arc<WebhookClient>,
    email_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        store: Arc<dyn JobStore>,
        renderer: Arc<TemplateRenderer>,
        mailer: Arc<dyn Mailer>,
        client: Arc<WebhookClient>,
        email_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, renderer, mailer, client, email_timeout, clock }
    }

    /// Makes one delivery attempt for `job`.
    ///
    /// # Errors
    ///
    /// Returns the transport failure, classified by `is_retryable`. A
    /// `DeliveryError::DatabaseError` means the job store could not be read
    /// and says nothing about the job itself.
    pub async fn dispatch(&self, job: &DeliveryJob) -> Result<Delivered> {
        match (&job.destination.0, &job.payload.0) {
            (Destination::Email { address, name }, JobPayload::Email { template, variables }) => {
                self.send_email(job, address, name.as_deref(), template, variables).await
            },
            (Destination::Webhook { endpoint_id }, JobPayload::Webhook { event_type, data }) => {
                self.send_webhook(job, *endpoint_id, event_type, data).await
            },
            _ => Err(DeliveryError::render(format!(
                "job {} has a {} destination with a {} payload",
                job.id,
                job.destination.0.kind(),
                job.payload.0.kind()
            ))),
        }
    }

    async fn send_email(
        &self,
        job: &DeliveryJob,
        address: &str,
        name: Option<&str>,
        template_name: &str,
        variables: &TemplateVariables,
    ) -> Result<Delivered> {
        let template = self
            .store
            .find_template(template_name)
            .await?
            .ok_or_else(|| RenderError::UnknownTemplate(template_name.to_string()))?;
        let rendered = self.renderer.render_email(&template, variables)?;

        let email = OutgoingEmail {
            delivery_id: job.id,
            to_address: address.to_string(),
            to_name: name.map(str::to_string),
            subject: rendered.subject,
            text: rendered.text,
            html: rendered.html,
        };

        debug!(job_id = %job.id, template = template_name, "sending email");

        let receipt = tokio::time::timeout(self.email_timeout, self.mailer.send(&email))
            .await
            .map_err(|_elapsed| DeliveryError::timeout(self.email_timeout.as_secs()))??;

        Ok(Delivered { status_code: receipt.code })
    }

    async fn send_webhook(
        &self,
        job: &DeliveryJob,
        endpoint_id: EndpointId,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<Delivered> {
        let endpoint = self
            .store
            .find_endpoint(endpoint_id)
            .await?
            .ok_or_else(|| DeliveryError::endpoint_unavailable(endpoint_id, "endpoint not found"))?;

        if !endpoint.is_active {
            return Err(DeliveryError::endpoint_unavailable(endpoint_id, "endpoint is inactive"));
        }
        if !endpoint.subscribes_to(event_type) {
            return Err(DeliveryError::endpoint_unavailable(
                endpoint_id,
                format!("endpoint is no longer subscribed to {event_type}"),
            ));
        }

        let rendered =
            render_webhook(job.id, event_type, data, &endpoint.secret_key, self.clock.now_utc())?;

        let request = WebhookRequest {
            delivery_id: job.id,
            url: endpoint.url.clone(),
            event_type: event_type.to_string(),
            body: rendered.body,
            signature: rendered.signature,
            attempt_number: job.attempt_number(),
            custom_headers: endpoint.custom_headers.0.clone(),
            timeout: endpoint.timeout_or(self.client.default_timeout()),
        };

        let response = self.client.deliver(request).await?;
        Ok(Delivered { status_code: Some(response.status_code) })
    }
}
