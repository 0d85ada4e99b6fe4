//! Delivery provider abstraction.
//!
//! A provider sends one fully-resolved message (bodies already rendered,
//! never a template reference) through a concrete transport. Providers are
//! stateless per call and classify their failures as permanent or transient
//! so the queue can decide whether to retry.

pub mod mock;
pub mod smtp;

pub use mock::MockProvider;
pub use smtp::{SmtpConfig, SmtpProvider};

use async_trait::async_trait;

use crate::error::DeliveryResult;
use crate::models::{EmailDeliveryStatus, EmailMessage, EmailResult};

/// Trait for email providers.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Send a single fully-resolved message.
    async fn send(&self, message: &EmailMessage) -> DeliveryResult<EmailResult>;

    /// Post-send delivery events (delivered/opened/bounced), when the
    /// transport can track them. Transports without tracking return `None`
    /// and callers fall back to the queue's "sent" record.
    async fn delivery_status(
        &self,
        _provider_message_id: &str,
    ) -> DeliveryResult<Option<EmailDeliveryStatus>> {
        Ok(None)
    }

    /// Verify transport reachability without sending mail.
    async fn health_check(&self) -> DeliveryResult<()>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Whether the transport renders templates itself; when false the
    /// caller pre-renders locally.
    fn supports_templates(&self) -> bool {
        false
    }

    /// Whether the transport reports post-send delivery events.
    fn supports_webhooks(&self) -> bool {
        false
    }
}
