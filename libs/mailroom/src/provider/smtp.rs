//! SMTP email provider using lettre

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::EmailProvider;
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{DeliveryState, EmailMessage, EmailResult};

/// SMTP provider configuration
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    pub use_tls: bool,
}

impl SmtpConfig {
    /// Read the full configuration from environment variables.
    pub fn from_env() -> DeliveryResult<Self> {
        Ok(Self {
            host: std::env::var("SMTP_HOST")
                .map_err(|_| DeliveryError::Validation("SMTP_HOST not set".to_string()))?,
            port: std::env::var("SMTP_PORT")
                .unwrap_or_else(|_| "587".to_string())
                .parse()
                .map_err(|_| DeliveryError::Validation("invalid SMTP_PORT".to_string()))?,
            username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
            from_email: std::env::var("EMAIL_FROM_ADDRESS")
                .map_err(|_| DeliveryError::Validation("EMAIL_FROM_ADDRESS not set".to_string()))?,
            from_name: std::env::var("EMAIL_FROM_NAME")
                .unwrap_or_else(|_| "Notifications".to_string()),
            use_tls: std::env::var("SMTP_USE_TLS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        })
    }

    /// Configuration for Mailpit/Mailhog on localhost (local development).
    pub fn local() -> Self {
        Self {
            host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("SMTP_PORT")
                .unwrap_or_else(|_| "1025".to_string())
                .parse()
                .unwrap_or(1025),
            username: String::new(),
            password: String::new(),
            from_email: std::env::var("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|_| "noreply@localhost".to_string()),
            from_name: std::env::var("EMAIL_FROM_NAME")
                .unwrap_or_else(|_| "Development".to_string()),
            use_tls: false,
        }
    }
}

/// SMTP email provider
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    config: SmtpConfig,
}

impl SmtpProvider {
    /// Create a new SMTP provider
    pub fn new(config: SmtpConfig) -> DeliveryResult<Self> {
        let transport = if config.use_tls {
            let creds = Credentials::new(config.username.clone(), config.password.clone());
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| {
                    DeliveryError::provider_permanent(format!("failed to create SMTP relay: {e}"))
                })?
                .credentials(creds)
                .port(config.port)
                .build()
        } else if !config.username.is_empty() {
            let creds = Credentials::new(config.username.clone(), config.password.clone());
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .credentials(creds)
                .port(config.port)
                .build()
        } else {
            // No auth (for Mailpit/Mailhog)
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .port(config.port)
                .build()
        };

        Ok(Self { transport, config })
    }

    /// Create a provider from environment variables
    pub fn from_env() -> DeliveryResult<Self> {
        Self::new(SmtpConfig::from_env()?)
    }

    /// Create a provider for local development (Mailpit/Mailhog, no auth)
    pub fn local() -> DeliveryResult<Self> {
        Self::new(SmtpConfig::local())
    }

    fn parse_mailbox(address: &str, role: &str) -> DeliveryResult<Mailbox> {
        address
            .parse()
            .map_err(|e| DeliveryError::Validation(format!("invalid {role} address: {e}")))
    }

    fn build_message(&self, email: &EmailMessage) -> DeliveryResult<Message> {
        let from_email = email.from_email.as_deref().unwrap_or(&self.config.from_email);
        let from_name = email.from_name.as_deref().unwrap_or(&self.config.from_name);
        let from = Self::parse_mailbox(&format!("{from_name} <{from_email}>"), "from")?;

        let mut builder = Message::builder().from(from).subject(&email.subject);
        for to in &email.to {
            builder = builder.to(Self::parse_mailbox(to, "to")?);
        }
        for cc in &email.cc {
            builder = builder.cc(Self::parse_mailbox(cc, "CC")?);
        }
        for bcc in &email.bcc {
            builder = builder.bcc(Self::parse_mailbox(bcc, "BCC")?);
        }
        if let Some(reply_to) = &email.reply_to {
            builder = builder.reply_to(Self::parse_mailbox(reply_to, "reply-to")?);
        }

        let text_part = email.body_text.as_ref().map(|text| {
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone())
        });
        let html_part = email.body_html.as_ref().map(|html| {
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(html.clone())
        });

        let body = match (text_part, html_part) {
            (Some(text), Some(html)) => {
                MultiPart::mixed().multipart(MultiPart::alternative().singlepart(text).singlepart(html))
            }
            (Some(text), None) => MultiPart::mixed().singlepart(text),
            (None, Some(html)) => MultiPart::mixed().singlepart(html),
            (None, None) => {
                return Err(DeliveryError::Validation(
                    "email must have either text or HTML body".to_string(),
                ));
            }
        };

        let mut body = body;
        for attachment in &email.attachments {
            let content_type = attachment.content_type.parse::<ContentType>().map_err(|e| {
                DeliveryError::Validation(format!(
                    "invalid attachment content type {}: {e}",
                    attachment.content_type
                ))
            })?;
            body = body.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }

        let mut message = builder
            .multipart(body)
            .map_err(|e| DeliveryError::Validation(format!("failed to build message: {e}")))?;

        for (name, value) in &email.headers {
            let header_name = HeaderName::new_from_ascii(name.clone()).map_err(|e| {
                DeliveryError::Validation(format!("invalid header name {name}: {e}"))
            })?;
            message
                .headers_mut()
                .insert_raw(HeaderValue::new(header_name, value.clone()));
        }

        Ok(message)
    }
}

fn classify_smtp_error(err: lettre::transport::smtp::Error) -> DeliveryError {
    // 5xx responses are permanent rejections; everything else is worth a retry
    if err.is_permanent() {
        DeliveryError::provider_permanent(err.to_string())
    } else {
        DeliveryError::provider_transient(err.to_string())
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, email: &EmailMessage) -> DeliveryResult<EmailResult> {
        let message = self.build_message(email)?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(classify_smtp_error)?;

        let provider_message_id = response.message().next().map(|s| s.to_string());

        tracing::info!(
            message_id = %email.id,
            to = ?email.to,
            subject = %email.subject,
            "Email sent via SMTP"
        );

        Ok(EmailResult {
            message_id: email.id,
            provider: self.name().to_string(),
            provider_message_id,
            state: DeliveryState::Sent,
            completed_at: Utc::now(),
        })
    }

    async fn health_check(&self) -> DeliveryResult<()> {
        let reachable = self
            .transport
            .test_connection()
            .await
            .map_err(|e| DeliveryError::provider_transient(format!("SMTP health check failed: {e}")))?;
        if reachable {
            Ok(())
        } else {
            Err(DeliveryError::provider_transient(
                "SMTP server rejected connection test",
            ))
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> SmtpProvider {
        SmtpProvider::new(SmtpConfig {
            host: "localhost".to_string(),
            port: 1025,
            username: String::new(),
            password: String::new(),
            from_email: "noreply@example.com".to_string(),
            from_name: "Notifications".to_string(),
            use_tls: false,
        })
        .unwrap()
    }

    #[test]
    fn test_build_message_fills_default_sender() {
        let provider = provider();
        let email = EmailMessage::new("user@example.com", "Hello").with_text("Body");

        let message = provider.build_message(&email).unwrap();
        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("noreply@example.com"));
    }

    #[test]
    fn test_build_message_requires_a_body() {
        let provider = provider();
        let email = EmailMessage::new("user@example.com", "Hello");

        let err = provider.build_message(&email).unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let provider = provider();
        let email = EmailMessage::new("not-an-address", "Hello").with_text("Body");

        let err = provider.build_message(&email).unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
    }

    #[test]
    fn test_build_message_with_attachment_and_headers() {
        let provider = provider();
        let email = EmailMessage::new("user@example.com", "Report")
            .with_text("See attached")
            .with_header("X-Campaign", "quarterly")
            .with_attachment(crate::models::Attachment::new(
                "report.csv",
                "text/csv",
                b"a,b\n1,2\n".to_vec(),
            ));

        let message = provider.build_message(&email).unwrap();
        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("X-Campaign"));
        assert!(formatted.contains("report.csv"));
    }
}
