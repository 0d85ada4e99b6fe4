//! Error types for the delivery subsystem.
//!
//! Errors carry a retry classification: validation and template errors are
//! caller mistakes and are never retried; provider errors are retried with
//! backoff unless the provider tags them permanent; queue and serialization
//! errors are treated as transient.

use thiserror::Error;

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Errors that can occur in the delivery subsystem.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Message rejected before it reached the queue.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No template registered under the requested id.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// Template failed registration-time validation.
    #[error("invalid template: {0}")]
    TemplateInvalid(String),

    /// Declared template variables absent from the supplied map.
    #[error("missing template variables: {}", .0.join(", "))]
    TemplateMissingVariables(Vec<String>),

    /// Provider failure (SMTP, etc.).
    #[error("provider failure: {message}")]
    Provider { message: String, permanent: bool },

    /// Queue storage failure.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DeliveryError {
    /// Create a transient provider error (retried with backoff).
    pub fn provider_transient(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            permanent: false,
        }
    }

    /// Create a permanent provider error (skips the retry loop).
    pub fn provider_permanent(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            permanent: true,
        }
    }

    /// Whether retrying this error can ever succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::TemplateNotFound(_)
            | Self::TemplateInvalid(_)
            | Self::TemplateMissingVariables(_) => true,
            Self::Provider { permanent, .. } => *permanent,
            Self::QueueUnavailable(_) | Self::Serialization(_) => false,
        }
    }
}

impl From<redis::RedisError> for DeliveryError {
    fn from(err: redis::RedisError) -> Self {
        Self::QueueUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<handlebars::TemplateError> for DeliveryError {
    fn from(err: handlebars::TemplateError) -> Self {
        Self::TemplateInvalid(err.to_string())
    }
}

impl From<handlebars::RenderError> for DeliveryError {
    fn from(err: handlebars::RenderError) -> Self {
        Self::TemplateInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanence_classification() {
        assert!(DeliveryError::Validation("no recipients".into()).is_permanent());
        assert!(DeliveryError::TemplateNotFound("welcome".into()).is_permanent());
        assert!(DeliveryError::provider_permanent("550 no such user").is_permanent());

        assert!(!DeliveryError::provider_transient("connection reset").is_permanent());
        assert!(!DeliveryError::QueueUnavailable("timeout".into()).is_permanent());
        assert!(!DeliveryError::Serialization("bad payload".into()).is_permanent());
    }

    #[test]
    fn test_missing_variables_display() {
        let err = DeliveryError::TemplateMissingVariables(vec![
            "reset_url".to_string(),
            "app_name".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "missing template variables: reset_url, app_name"
        );
    }
}
