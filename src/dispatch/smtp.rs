//! SMTP mail sender via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::MailConfig;
use crate::error::DeliveryError;

use super::delivery::{Envelope, MailSender};

const NAME: &str = "smtp";

/// Sends envelopes through an SMTP relay.
pub struct SmtpMailer {
    config: MailConfig,
}

impl SmtpMailer {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<SmtpTransport, DeliveryError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        Ok(SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| DeliveryError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    fn name(&self) -> &str {
        NAME
    }

    fn sender_address(&self) -> &str {
        &self.config.from_address
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let message = build_message(&self.config.from_address, envelope)?;
        let transport = self.transport()?;

        let result = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| DeliveryError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP task failed: {e}"),
            })?;

        match result {
            Ok(_) => {
                info!(to = %envelope.recipients.join(", "), attachments = envelope.attachments.len(), "Email sent");
                Ok(())
            }
            Err(e) if is_auth_failure(&e) => Err(DeliveryError::SessionExpired { name: NAME.into() }),
            Err(e) => Err(DeliveryError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP send failed: {e}"),
            }),
        }
    }
}

/// SMTP 535: authentication credentials invalid.
fn is_auth_failure(err: &lettre::transport::smtp::Error) -> bool {
    err.status().is_some_and(|code| code.to_string() == "535")
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Build the RFC 5322 message for `envelope`. Attachments make it a
/// `multipart/mixed` message with the body as the first part.
pub fn build_message(from: &str, envelope: &Envelope) -> Result<Message, DeliveryError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(from)?)
        .subject(envelope.subject.clone());
    for to in &envelope.recipients {
        builder = builder.to(parse_mailbox(to)?);
    }

    let built = if envelope.attachments.is_empty() {
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(envelope.body.clone())
    } else {
        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(envelope.body.clone()));
        for attachment in &envelope.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| DeliveryError::Build(e.to_string()))?;
            parts = parts.singlepart(
                Attachment::new(attachment.filename.clone()).body(attachment.decode()?, content_type),
            );
        }
        builder.multipart(parts)
    };

    built.map_err(|e| DeliveryError::Build(e.to_string()))
}
