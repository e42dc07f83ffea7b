//! Email transports.
//!
//! `SmtpMailer` relays through an SMTP server with lettre's pooled async
//! transport. Relay replies are classified by their code class: 4xx is
//! transient, 5xx permanent. `LogMailer` stands in when no relay is
//! configured and only logs what it would have sent.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::JobId;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart},
    transport::smtp::{authentication::Credentials, Error as SmtpError},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info};

use crate::error::{DeliveryError, Result};

/// A rendered email ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    /// Job being delivered.
    pub delivery_id: JobId,
    /// Recipient address.
    pub to_address: String,
    /// Recipient display name.
    pub to_name: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
}

/// Relay acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailReceipt {
    /// SMTP reply code.
    pub code: Option<u16>,
    /// Relay reply text.
    pub message: String,
}

/// Sends rendered emails.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Hands `email` to the transport.
    ///
    /// # Errors
    ///
    /// Returns a transient or permanent `DeliveryError` describing why the
    /// transport did not accept the message.
    async fn send(&self, email: &OutgoingEmail) -> Result<MailReceipt>;
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Relay host name.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Login user.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// `From` mailbox, e.g. `Courier <no-reply@example.com>`.
    pub from: String,
    /// Upgrade the connection with STARTTLS.
    pub starttls: bool,
    /// Per-message timeout.
    pub timeout: Duration,
}

/// Mailer relaying through an SMTP server.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpMailer {
    /// Creates a mailer for the relay described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the relay host or the
    /// `From` mailbox is invalid.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(|e| {
                DeliveryError::configuration(format!("invalid SMTP relay {}: {e}", config.host))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from = config.from.parse::<Mailbox>().map_err(|e| {
            DeliveryError::configuration(format!("invalid SMTP from address {}: {e}", config.from))
        })?;

        Ok(Self { transport: builder.build(), from, timeout: config.timeout })
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message> {
        let address = email
            .to_address
            .parse::<Address>()
            .map_err(|_| DeliveryError::invalid_recipient(&email.to_address))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(email.to_name.clone(), address))
            .subject(email.subject.clone())
            .message_id(Some(format!("<{}@courier>", email.delivery_id)));

        let message = match (&email.text, &email.html) {
            (Some(text), Some(html)) => {
                builder.multipart(MultiPart::alternative_plain_html(text.clone(), html.clone()))
            },
            (Some(text), None) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
            (None, Some(html)) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
            (None, None) => {
                return Err(DeliveryError::render("email has neither text nor HTML body"));
            },
        };

        message.map_err(|e| DeliveryError::render(format!("failed to build message: {e}")))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<MailReceipt> {
        let message = self.build_message(email)?;

        let response = match tokio::time::timeout(self.timeout, self.transport.send(message)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(classify_smtp_error(&error)),
            Err(_elapsed) => return Err(DeliveryError::timeout(self.timeout.as_secs())),
        };

        let receipt = MailReceipt {
            code: response.code().to_string().parse().ok(),
            message: response.message().collect::<Vec<_>>().join(" "),
        };

        debug!(delivery_id = %email.delivery_id, code = ?receipt.code, "relay accepted message");
        Ok(receipt)
    }
}

fn classify_smtp_error(error: &SmtpError) -> DeliveryError {
    let code = error.status().and_then(|code| code.to_string().parse::<u16>().ok());

    if error.is_permanent() {
        DeliveryError::SmtpPermanent { code, message: error.to_string() }
    } else if error.is_transient() {
        DeliveryError::SmtpTransient { code, message: error.to_string() }
    } else if error.is_timeout() {
        DeliveryError::network(format!("SMTP timeout: {error}"))
    } else {
        DeliveryError::network(format!("SMTP connection failed: {error}"))
    }
}

/// Mailer that logs messages instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<MailReceipt> {
        email
            .to_address
            .parse::<Address>()
            .map_err(|_| DeliveryError::invalid_recipient(&email.to_address))?;

        info!(
            delivery_id = %email.delivery_id,
            to = %email.to_address,
            subject = %email.subject,
            "no SMTP relay configured, email logged instead of sent"
        );

        Ok(MailReceipt { code: Some(250), message: "logged".to_string() })
    }
}
