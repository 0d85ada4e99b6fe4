//! Domain types shared across the delivery subsystem.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A file attached to an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            content,
        }
    }
}

/// An outbound send request. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailMessage {
    /// Unique identifier for the message
    pub id: Uuid,
    /// Sender email (defaults to the configured from address)
    pub from_email: Option<String>,
    /// Sender display name
    pub from_name: Option<String>,
    /// Recipient email addresses
    pub to: Vec<String>,
    /// CC recipients
    #[serde(default)]
    pub cc: Vec<String>,
    /// BCC recipients
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Reply-to address
    pub reply_to: Option<String>,
    /// Email subject
    pub subject: String,
    /// HTML body
    pub body_html: Option<String>,
    /// Plain text body
    pub body_text: Option<String>,
    /// Template id (if the bodies were rendered from a template)
    pub template_id: Option<String>,
    /// Template variables
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// File attachments
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Custom message headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Free-form tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Queue ordering priority, higher first
    #[serde(default)]
    pub priority: i32,
    /// Earliest delivery time; None means eligible immediately
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the message was created
    pub created_at: DateTime<Utc>,
}

impl EmailMessage {
    /// Create a new message with required fields
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_email: None,
            from_name: None,
            to: vec![to.into()],
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: subject.into(),
            body_html: None,
            body_text: None,
            template_id: None,
            variables: Map::new(),
            attachments: Vec::new(),
            headers: HashMap::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            priority: 0,
            scheduled_at: None,
            created_at: Utc::now(),
        }
    }

    /// Add another recipient
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    /// Set the sender address and display name
    pub fn with_from(mut self, email: impl Into<String>, name: impl Into<String>) -> Self {
        self.from_email = Some(email.into());
        self.from_name = Some(name.into());
        self
    }

    /// Add a CC recipient
    pub fn with_cc(mut self, cc: impl Into<String>) -> Self {
        self.cc.push(cc.into());
        self
    }

    /// Add a BCC recipient
    pub fn with_bcc(mut self, bcc: impl Into<String>) -> Self {
        self.bcc.push(bcc.into());
        self
    }

    /// Set the reply-to address
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set plain text body
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.body_text = Some(text.into());
        self
    }

    /// Set HTML body
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.body_html = Some(html.into());
        self
    }

    /// Record the template and variables the bodies were rendered from
    pub fn with_template(mut self, id: impl Into<String>, variables: Map<String, Value>) -> Self {
        self.template_id = Some(id.into());
        self.variables = variables;
        self
    }

    /// Add an attachment
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Add a custom header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the earliest delivery time
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Check if the message carries at least one body variant
    pub fn has_body(&self) -> bool {
        self.body_text.is_some() || self.body_html.is_some()
    }
}

/// Where a message sits in its delivery lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Queued,
    Sending,
    Retrying,
    Sent,
    Delivered,
    Opened,
    Bounced,
    Failed,
    Cancelled,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Queued => write!(f, "queued"),
            DeliveryState::Sending => write!(f, "sending"),
            DeliveryState::Retrying => write!(f, "retrying"),
            DeliveryState::Sent => write!(f, "sent"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::Opened => write!(f, "opened"),
            DeliveryState::Bounced => write!(f, "bounced"),
            DeliveryState::Failed => write!(f, "failed"),
            DeliveryState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of handing a message to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailResult {
    /// Our message id
    pub message_id: Uuid,
    /// Provider that performed the send
    pub provider: String,
    /// Provider-specific message id, when the transport reports one
    pub provider_message_id: Option<String>,
    /// Delivery state after the call (`Sent` on success)
    pub state: DeliveryState,
    pub completed_at: DateTime<Utc>,
}

/// Point-in-time view of a message's delivery progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailDeliveryStatus {
    pub message_id: Uuid,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Queue occupancy counts, computed on demand.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub sending: u64,
    pub retrying: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Rows whose `scheduled_at` lies in the future
    pub scheduled: u64,
}

impl QueueStats {
    /// Total rows across every status.
    pub fn total(&self) -> u64 {
        self.pending + self.sending + self.retrying + self.sent + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builder() {
        let mut variables = Map::new();
        variables.insert("user_name".to_string(), json!("John"));

        let message = EmailMessage::new("recipient@example.com", "Test Subject")
            .with_to("second@example.com")
            .with_cc("cc@example.com")
            .with_text("Plain text body")
            .with_html("<p>HTML body</p>")
            .with_priority(5)
            .with_tag("onboarding")
            .with_header("X-Campaign", "launch")
            .with_template("welcome", variables);

        assert_eq!(message.to.len(), 2);
        assert_eq!(message.cc, vec!["cc@example.com".to_string()]);
        assert_eq!(message.subject, "Test Subject");
        assert_eq!(message.priority, 5);
        assert_eq!(message.template_id, Some("welcome".to_string()));
        assert!(message.has_body());
    }

    #[test]
    fn test_message_serialization_round_trip() {
        let mut variables = Map::new();
        variables.insert("count".to_string(), json!(3));
        variables.insert("items".to_string(), json!(["a", "b"]));

        let message = EmailMessage::new("test@example.com", "Round trip")
            .with_bcc("hidden@example.com")
            .with_reply_to("replies@example.com")
            .with_text("Body")
            .with_attachment(Attachment::new("report.pdf", "application/pdf", vec![1, 2, 3]))
            .with_metadata("source", "signup")
            .with_template("custom", variables);

        let json = serde_json::to_string(&message).unwrap();
        let deserialized: EmailMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, message);
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            pending: 2,
            sending: 1,
            retrying: 1,
            sent: 5,
            failed: 1,
            cancelled: 0,
            scheduled: 1,
        };
        assert_eq!(stats.total(), 10);
    }
}
