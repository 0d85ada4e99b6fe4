//! Mock email provider for testing

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::EmailProvider;
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{DeliveryState, EmailDeliveryStatus, EmailMessage, EmailResult};

struct FailurePlan {
    message: String,
    permanent: bool,
    /// None fails every send; Some(n) fails the next n sends
    remaining: Option<u32>,
}

/// Mock email provider that captures sent messages. Clones share state, so
/// tests can keep a handle after moving the provider into a service.
#[derive(Clone)]
pub struct MockProvider {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
    failure: Arc<Mutex<Option<FailurePlan>>>,
}

impl MockProvider {
    /// Create a provider that accepts everything
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a provider that always fails transiently
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_failure(FailurePlan {
            message: message.into(),
            permanent: false,
            remaining: None,
        })
    }

    /// Create a provider that always fails permanently
    pub fn failing_permanently(message: impl Into<String>) -> Self {
        Self::with_failure(FailurePlan {
            message: message.into(),
            permanent: true,
            remaining: None,
        })
    }

    /// Create a provider that fails the first `count` sends transiently,
    /// then accepts everything
    pub fn failing_first(count: u32, message: impl Into<String>) -> Self {
        Self::with_failure(FailurePlan {
            message: message.into(),
            permanent: false,
            remaining: Some(count),
        })
    }

    fn with_failure(plan: FailurePlan) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(Some(plan))),
        }
    }

    /// Get all sent messages
    pub async fn sent_messages(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }

    /// Get the count of sent messages
    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Clear all sent messages
    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }

    /// Check if a message was sent to a specific address
    pub async fn was_sent_to(&self, address: &str) -> bool {
        self.sent
            .lock()
            .await
            .iter()
            .any(|message| message.to.iter().any(|to| to == address))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailProvider for MockProvider {
    async fn send(&self, email: &EmailMessage) -> DeliveryResult<EmailResult> {
        let planned_failure = {
            let mut failure = self.failure.lock().await;
            match failure.take() {
                None => None,
                Some(mut plan) => match plan.remaining {
                    Some(0) => None,
                    Some(ref mut n) => {
                        *n -= 1;
                        let outcome = (plan.message.clone(), plan.permanent);
                        *failure = Some(plan);
                        Some(outcome)
                    }
                    None => {
                        let outcome = (plan.message.clone(), plan.permanent);
                        *failure = Some(plan);
                        Some(outcome)
                    }
                },
            }
        };
        if let Some((message, permanent)) = planned_failure {
            return Err(DeliveryError::Provider { message, permanent });
        }

        self.sent.lock().await.push(email.clone());

        Ok(EmailResult {
            message_id: email.id,
            provider: self.name().to_string(),
            provider_message_id: Some(format!("mock-{}", email.id)),
            state: DeliveryState::Sent,
            completed_at: Utc::now(),
        })
    }

    async fn delivery_status(
        &self,
        provider_message_id: &str,
    ) -> DeliveryResult<Option<EmailDeliveryStatus>> {
        let sent = self.sent.lock().await;
        Ok(sent
            .iter()
            .find(|message| format!("mock-{}", message.id) == provider_message_id)
            .map(|message| EmailDeliveryStatus {
                message_id: message.id,
                state: DeliveryState::Delivered,
                attempts: 1,
                last_error: None,
                provider_message_id: Some(provider_message_id.to_string()),
                scheduled_at: None,
                sent_at: Some(Utc::now()),
            }))
    }

    async fn health_check(&self) -> DeliveryResult<()> {
        let failure = self.failure.lock().await;
        match failure.as_ref() {
            Some(plan) if plan.remaining.is_none() => Err(DeliveryError::provider_transient(
                format!("mock health check failed: {}", plan.message),
            )),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_webhooks(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: &str) -> EmailMessage {
        EmailMessage::new(to, "Test Subject").with_text("Test body")
    }

    #[tokio::test]
    async fn test_mock_provider_captures_messages() {
        let provider = MockProvider::new();

        provider.send(&message("test@example.com")).await.unwrap();

        let sent = provider.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["test@example.com".to_string()]);
        assert!(provider.was_sent_to("test@example.com").await);
        assert!(!provider.was_sent_to("other@example.com").await);
    }

    #[tokio::test]
    async fn test_mock_provider_fails() {
        let provider = MockProvider::failing("Simulated failure");

        let err = provider.send(&message("test@example.com")).await.unwrap_err();
        assert!(err.to_string().contains("Simulated failure"));
        assert!(!err.is_permanent());
        assert_eq!(provider.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_provider_permanent_failure() {
        let provider = MockProvider::failing_permanently("550 no such user");

        let err = provider.send(&message("gone@example.com")).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_mock_provider_fails_first_n() {
        let provider = MockProvider::failing_first(2, "temporarily down");

        assert!(provider.send(&message("a@example.com")).await.is_err());
        assert!(provider.send(&message("a@example.com")).await.is_err());
        assert!(provider.send(&message("a@example.com")).await.is_ok());
        assert_eq!(provider.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_provider_health_check() {
        assert!(MockProvider::new().health_check().await.is_ok());
        assert!(MockProvider::failing("down").health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_provider_delivery_status() {
        let provider = MockProvider::new();
        let email = message("track@example.com");
        let result = provider.send(&email).await.unwrap();

        let status = provider
            .delivery_status(result.provider_message_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.message_id, email.id);
        assert_eq!(status.state, DeliveryState::Delivered);

        assert!(provider.delivery_status("mock-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_provider_clear() {
        let provider = MockProvider::new();
        provider.send(&message("test@example.com")).await.unwrap();
        assert_eq!(provider.sent_count().await, 1);

        provider.clear().await;
        assert_eq!(provider.sent_count().await, 0);
    }
}
