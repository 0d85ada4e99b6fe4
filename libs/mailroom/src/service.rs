//! Delivery service: the orchestrator composing templates, queue and provider.
//!
//! `send`/`send_template`/`schedule` return as soon as the message is durably
//! enqueued; delivery happens asynchronously on `process_queue` ticks driven
//! by an external scheduler. `send_immediate` bypasses the queue for callers
//! that need a synchronous outcome and accept losing retry coverage.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{EmailDeliveryStatus, EmailMessage, EmailResult, QueueStats};
use crate::provider::EmailProvider;
use crate::queue::{EmailQueue, QueueStatus, QueuedEmail};
use crate::templates::{EmailTemplate, TemplateEngine};

/// Outcome counts for one `process_queue` tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub processed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Orchestrates validation, rendering, queueing and delivery.
pub struct DeliveryService<P: EmailProvider> {
    queue: Arc<dyn EmailQueue>,
    templates: Arc<TemplateEngine>,
    provider: Arc<P>,
    config: DeliveryConfig,
}

impl<P: EmailProvider> DeliveryService<P> {
    pub fn new(
        queue: Arc<dyn EmailQueue>,
        templates: Arc<TemplateEngine>,
        provider: P,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            queue,
            templates,
            provider: Arc::new(provider),
            config,
        }
    }

    fn apply_defaults(&self, message: &mut EmailMessage) {
        if message.from_email.is_none() {
            message.from_email = Some(self.config.from_email.clone());
        }
        if message.from_name.is_none() {
            message.from_name = Some(self.config.from_name.clone());
        }
    }

    fn validate(message: &EmailMessage) -> DeliveryResult<()> {
        if message.to.is_empty() {
            return Err(DeliveryError::Validation(
                "message has no recipients".to_string(),
            ));
        }
        if message.subject.trim().is_empty() {
            return Err(DeliveryError::Validation(
                "message has an empty subject".to_string(),
            ));
        }
        if !message.has_body() {
            return Err(DeliveryError::Validation(
                "message has neither an HTML nor a text body".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate and durably enqueue a message for asynchronous delivery.
    pub async fn send(&self, mut message: EmailMessage) -> DeliveryResult<Uuid> {
        self.apply_defaults(&mut message);
        Self::validate(&message)?;

        let id = self.queue.enqueue(&message, self.config.max_retries).await?;
        info!(
            message_id = %id,
            to = ?message.to,
            subject = %message.subject,
            "Email enqueued"
        );
        Ok(id)
    }

    /// Render a registered template and enqueue the result.
    ///
    /// Template errors (`TemplateNotFound`, `TemplateMissingVariables`)
    /// propagate unchanged, before anything reaches the queue.
    pub async fn send_template(
        &self,
        template_id: &str,
        to: Vec<String>,
        variables: Map<String, Value>,
    ) -> DeliveryResult<Uuid> {
        let rendered = self.templates.render(template_id, &variables).await?;

        let mut recipients = to.into_iter();
        let first = recipients.next().ok_or_else(|| {
            DeliveryError::Validation("message has no recipients".to_string())
        })?;
        let mut message = EmailMessage::new(first, rendered.subject)
            .with_template(template_id, variables);
        for recipient in recipients {
            message = message.with_to(recipient);
        }
        if let Some(html) = rendered.body_html {
            message = message.with_html(html);
        }
        if let Some(text) = rendered.body_text {
            message = message.with_text(text);
        }

        self.send(message).await
    }

    /// Send through the provider right now, bypassing the queue.
    ///
    /// Failures surface synchronously and are never retried.
    pub async fn send_immediate(&self, mut message: EmailMessage) -> DeliveryResult<EmailResult> {
        self.apply_defaults(&mut message);
        Self::validate(&message)?;
        self.send_via_provider(&message).await
    }

    /// Enqueue a message that becomes eligible only once `at` has passed.
    pub async fn schedule(&self, message: EmailMessage, at: DateTime<Utc>) -> DeliveryResult<Uuid> {
        self.send(message.with_scheduled_at(at)).await
    }

    /// Drain one bounded batch from the queue through the provider.
    ///
    /// Every claimed row either ends `sent` or advances its retry counter;
    /// a single bad message never blocks the rest of the batch.
    pub async fn process_queue(&self) -> DeliveryResult<ProcessSummary> {
        let batch = self.queue.dequeue(self.config.batch_size).await?;
        let mut summary = ProcessSummary::default();

        for row in batch {
            summary.processed += 1;
            // A row that no longer decodes counts as a failed send, so the
            // retry machinery still advances instead of dropping it
            let outcome = match row.decode() {
                Ok(message) => self.send_via_provider(&message).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(result) => {
                    match self
                        .queue
                        .mark_sent(row.id, result.provider_message_id.clone())
                        .await
                    {
                        Ok(()) => summary.sent += 1,
                        Err(err) => {
                            error!(
                                message_id = %row.id,
                                error = %err,
                                "Failed to record sent email"
                            );
                            summary.failed += 1;
                        }
                    }
                }
                Err(err) => self.record_failure(&row, err, &mut summary).await,
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                sent = summary.sent,
                retried = summary.retried,
                failed = summary.failed,
                "Processed email batch"
            );
        }
        Ok(summary)
    }

    async fn record_failure(
        &self,
        row: &QueuedEmail,
        err: DeliveryError,
        summary: &mut ProcessSummary,
    ) {
        warn!(
            message_id = %row.id,
            attempt = row.attempt_count + 1,
            error = %err,
            "Email send failed"
        );
        match self.queue.mark_failed(row.id, &err).await {
            Ok(QueueStatus::Retrying) => summary.retried += 1,
            Ok(_) => summary.failed += 1,
            Err(queue_err) => {
                error!(
                    message_id = %row.id,
                    error = %queue_err,
                    "Failed to record send failure"
                );
                summary.failed += 1;
            }
        }
    }

    async fn send_via_provider(&self, message: &EmailMessage) -> DeliveryResult<EmailResult> {
        match tokio::time::timeout(self.config.send_timeout, self.provider.send(message)).await {
            Ok(result) => result,
            // An elapsed deadline feeds the retry machinery like any other
            // transient provider failure
            Err(_) => Err(DeliveryError::provider_transient(format!(
                "send timed out after {:?}",
                self.config.send_timeout
            ))),
        }
    }

    /// Aggregate provider and queue health into one pass/fail signal.
    pub async fn health_check(&self) -> DeliveryResult<()> {
        self.provider.health_check().await?;
        self.queue.stats().await?;
        debug!(provider = self.provider.name(), "Delivery health check passed");
        Ok(())
    }

    pub async fn get_queue_stats(&self) -> DeliveryResult<QueueStats> {
        self.queue.stats().await
    }

    /// Delivery progress for a message, preferring provider-side events when
    /// the transport tracks them.
    pub async fn get_delivery_status(&self, message_id: Uuid) -> DeliveryResult<EmailDeliveryStatus> {
        let row = self.queue.get(message_id).await?.ok_or_else(|| {
            DeliveryError::Validation(format!("unknown message {message_id}"))
        })?;

        if row.status == QueueStatus::Sent && self.provider.supports_webhooks() {
            if let Some(provider_message_id) = &row.provider_message_id {
                if let Some(status) = self.provider.delivery_status(provider_message_id).await? {
                    return Ok(status);
                }
            }
        }
        Ok(EmailDeliveryStatus::from(&row))
    }

    pub async fn register_template(&self, template: EmailTemplate) -> DeliveryResult<()> {
        self.templates.register(template).await
    }

    pub async fn get_template(&self, id: &str) -> DeliveryResult<EmailTemplate> {
        self.templates.get(id).await
    }

    pub async fn list_templates(&self) -> Vec<String> {
        self.templates.list().await
    }

    /// Bulk-reset failed rows for manual recovery after an outage.
    pub async fn retry_failed(&self, max_retries: u32) -> DeliveryResult<u64> {
        self.queue.retry_failed(max_retries).await
    }

    /// Remove terminal rows older than `older_than`.
    pub async fn purge_old(&self, older_than: Duration) -> DeliveryResult<u64> {
        self.queue.purge_old(older_than).await
    }

    /// Cancel an unclaimed message.
    pub async fn cancel(&self, message_id: Uuid) -> DeliveryResult<()> {
        self.queue.cancel(message_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::queue::MemoryQueue;

    fn service(provider: MockProvider) -> (DeliveryService<MockProvider>, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new());
        let service = DeliveryService::new(
            queue.clone(),
            Arc::new(TemplateEngine::new().unwrap()),
            provider,
            DeliveryConfig::default().with_from("noreply@example.com", "Notifications"),
        );
        (service, queue)
    }

    #[tokio::test]
    async fn test_send_rejects_invalid_messages() {
        let (service, _queue) = service(MockProvider::new());

        let no_body = EmailMessage::new("user@example.com", "Subject");
        assert!(matches!(
            service.send(no_body).await.unwrap_err(),
            DeliveryError::Validation(_)
        ));

        let mut no_recipient = EmailMessage::new("user@example.com", "Subject").with_text("Body");
        no_recipient.to.clear();
        assert!(matches!(
            service.send(no_recipient).await.unwrap_err(),
            DeliveryError::Validation(_)
        ));

        let blank_subject = EmailMessage::new("user@example.com", "  ").with_text("Body");
        assert!(matches!(
            service.send(blank_subject).await.unwrap_err(),
            DeliveryError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_send_applies_sender_defaults() {
        let (service, queue) = service(MockProvider::new());

        let id = service
            .send(EmailMessage::new("user@example.com", "Subject").with_text("Body"))
            .await
            .unwrap();

        let row = queue.get(id).await.unwrap().unwrap();
        let message = row.decode().unwrap();
        assert_eq!(message.from_email.as_deref(), Some("noreply@example.com"));
        assert_eq!(message.from_name.as_deref(), Some("Notifications"));

        let status = service.get_delivery_status(id).await.unwrap();
        assert_eq!(status.state, crate::models::DeliveryState::Queued);
    }

    #[tokio::test]
    async fn test_send_immediate_bypasses_queue() {
        let (service, _queue) = service(MockProvider::new());

        let result = service
            .send_immediate(EmailMessage::new("user@example.com", "Now").with_text("Body"))
            .await
            .unwrap();
        assert_eq!(result.state, crate::models::DeliveryState::Sent);

        // Nothing was queued
        let stats = service.get_queue_stats().await.unwrap();
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn test_process_queue_sends_and_marks() {
        let (service, _queue) = service(MockProvider::new());

        let id = service
            .send(EmailMessage::new("user@example.com", "Subject").with_text("Body"))
            .await
            .unwrap();

        let summary = service.process_queue().await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.sent, 1);

        let status = service.get_delivery_status(id).await.unwrap();
        assert!(matches!(
            status.state,
            crate::models::DeliveryState::Sent | crate::models::DeliveryState::Delivered
        ));
    }
}
