//! Delivery service configuration.

use std::time::Duration;

/// Which provider implementation the service should send through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// SMTP via lettre
    Smtp,
    /// In-process mock (tests, local development)
    Mock,
}

impl ProviderKind {
    /// Parse a provider name, defaulting to SMTP for unknown values.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "mock" => ProviderKind::Mock,
            _ => ProviderKind::Smtp,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Smtp => write!(f, "smtp"),
            ProviderKind::Mock => write!(f, "mock"),
        }
    }
}

/// Configuration for the delivery service.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Default sender address applied to messages without one.
    pub from_email: String,
    /// Default sender display name.
    pub from_name: String,
    /// Provider selection.
    pub provider: ProviderKind,
    /// Retry budget for newly enqueued messages.
    pub max_retries: u32,
    /// Rows claimed per processing tick.
    pub batch_size: usize,
    /// Upper bound on a single provider send.
    pub send_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            from_email: std::env::var("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|_| "noreply@example.com".to_string()),
            from_name: std::env::var("EMAIL_FROM_NAME")
                .unwrap_or_else(|_| "Notifications".to_string()),
            provider: ProviderKind::parse(
                &std::env::var("EMAIL_PROVIDER").unwrap_or_else(|_| "smtp".to_string()),
            ),
            max_retries: std::env::var("EMAIL_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            batch_size: std::env::var("EMAIL_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            send_timeout: Duration::from_secs(
                std::env::var("EMAIL_SEND_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),
        }
    }
}

impl DeliveryConfig {
    /// Set the default sender.
    pub fn with_from(mut self, email: impl Into<String>, name: impl Into<String>) -> Self {
        self.from_email = email.into();
        self.from_name = name.into();
        self
    }

    /// Set the provider selection.
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the processing batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the per-send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}
