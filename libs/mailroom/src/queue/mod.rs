//! Durable queue of outbound messages and its retry state machine.
//!
//! The queue exclusively owns `QueuedEmail` lifecycle: rows are created by
//! `enqueue`, claimed by `dequeue` (pending/retrying → sending), and finished
//! by `mark_sent` / `mark_failed`. Every dequeued row either ends `sent` or
//! advances its retry counter; there is no drop-and-forget path.

pub mod memory;
pub mod redis;

pub use memory::MemoryQueue;
pub use self::redis::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{DeliveryState, EmailDeliveryStatus, EmailMessage, QueueStats};

/// Processing status of a queued message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Retrying,
    Cancelled,
}

impl QueueStatus {
    /// All statuses, for index iteration.
    pub const ALL: [QueueStatus; 6] = [
        QueueStatus::Pending,
        QueueStatus::Sending,
        QueueStatus::Sent,
        QueueStatus::Failed,
        QueueStatus::Retrying,
        QueueStatus::Cancelled,
    ];

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Sent | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Sending => write!(f, "sending"),
            QueueStatus::Sent => write!(f, "sent"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::Retrying => write!(f, "retrying"),
            QueueStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Delay before a failed message becomes eligible for dequeue again.
///
/// Doubles per attempt with the shift clamped at 6 and the resulting delay
/// capped at 60 minutes: 2, 4, 8, 16, 32, 60, 60, ... minutes for attempts
/// 1, 2, 3, ...
pub fn backoff(attempt: u32) -> Duration {
    let minutes = (1u64 << attempt.min(6)).min(60);
    Duration::from_secs(minutes * 60)
}

fn default_max_retries() -> u32 {
    3
}

/// The persisted, queue-owned projection of an [`EmailMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEmail {
    pub id: Uuid,
    /// Serialized [`EmailMessage`]; decoded when the row is processed so a
    /// decode failure feeds the retry machinery like any send failure.
    pub message: String,
    pub status: QueueStatus,
    /// Denormalized from the message for dequeue ordering
    pub priority: i32,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Earliest eligibility; None means eligible immediately
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set only on success
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedEmail {
    /// Serialize a message into a fresh pending row.
    pub fn new(message: &EmailMessage, max_retries: u32) -> DeliveryResult<Self> {
        Ok(Self {
            id: message.id,
            message: serde_json::to_string(message)?,
            status: QueueStatus::Pending,
            priority: message.priority,
            attempt_count: 0,
            max_retries,
            last_error: None,
            scheduled_at: message.scheduled_at,
            sent_at: None,
            provider_message_id: None,
            created_at: message.created_at,
        })
    }

    /// Deserialize the row back into the original message.
    pub fn decode(&self) -> DeliveryResult<EmailMessage> {
        Ok(serde_json::from_str(&self.message)?)
    }

    /// Whether the row may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, QueueStatus::Pending | QueueStatus::Retrying)
            && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Claim the row for a worker.
    pub fn claim(&mut self) {
        self.status = QueueStatus::Sending;
    }

    /// Record a successful send. Terminal.
    pub fn record_sent(&mut self, provider_message_id: Option<String>, now: DateTime<Utc>) {
        self.status = QueueStatus::Sent;
        self.sent_at = Some(now);
        self.provider_message_id = provider_message_id;
    }

    /// Advance the retry state machine after a failed send.
    ///
    /// Permanent errors and exhausted retry budgets end in terminal `failed`;
    /// otherwise the row re-enters `retrying` with a backoff delay.
    pub fn record_failure(
        &mut self,
        error: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> QueueStatus {
        self.attempt_count += 1;
        self.last_error = Some(error.to_string());
        if permanent || self.attempt_count >= self.max_retries {
            self.status = QueueStatus::Failed;
            self.scheduled_at = None;
        } else {
            self.status = QueueStatus::Retrying;
            self.scheduled_at =
                Some(now + chrono::Duration::seconds(backoff(self.attempt_count).as_secs() as i64));
        }
        self.status
    }

    /// Reset a failed row back to pending (bulk recovery after an outage).
    pub fn reset_for_retry(&mut self) {
        self.status = QueueStatus::Pending;
        self.scheduled_at = None;
    }

    /// Cancel a row that has not been claimed. Returns false for rows in any
    /// other status.
    pub fn cancel(&mut self) -> bool {
        match self.status {
            QueueStatus::Pending | QueueStatus::Retrying => {
                self.status = QueueStatus::Cancelled;
                self.scheduled_at = None;
                true
            }
            _ => false,
        }
    }
}

impl From<&QueuedEmail> for EmailDeliveryStatus {
    fn from(row: &QueuedEmail) -> Self {
        let state = match row.status {
            QueueStatus::Pending => DeliveryState::Queued,
            QueueStatus::Sending => DeliveryState::Sending,
            QueueStatus::Retrying => DeliveryState::Retrying,
            QueueStatus::Sent => DeliveryState::Sent,
            QueueStatus::Failed => DeliveryState::Failed,
            QueueStatus::Cancelled => DeliveryState::Cancelled,
        };
        Self {
            message_id: row.id,
            state,
            attempts: row.attempt_count,
            last_error: row.last_error.clone(),
            provider_message_id: row.provider_message_id.clone(),
            scheduled_at: row.scheduled_at,
            sent_at: row.sent_at,
        }
    }
}

/// Durable store of outbound email work items.
///
/// Implementations must make the dequeue claim atomic: two workers polling
/// concurrently must never receive the same row.
#[async_trait]
pub trait EmailQueue: Send + Sync {
    /// Persist a message as a pending row.
    async fn enqueue(&self, message: &EmailMessage, max_retries: u32) -> DeliveryResult<Uuid>;

    /// Claim up to `limit` eligible rows (pending/retrying, `scheduled_at`
    /// elapsed), ordered by priority descending then creation time ascending.
    /// Claimed rows are returned with `status = sending`.
    async fn dequeue(&self, limit: usize) -> DeliveryResult<Vec<QueuedEmail>>;

    /// Record a successful send. Terminal.
    async fn mark_sent(&self, id: Uuid, provider_message_id: Option<String>) -> DeliveryResult<()>;

    /// Record a failed send; returns the resulting status (`retrying` or
    /// terminal `failed`).
    async fn mark_failed(&self, id: Uuid, error: &DeliveryError) -> DeliveryResult<QueueStatus>;

    /// Reset every failed row with `attempt_count < max_retries` back to
    /// pending. Returns the number of rows reset.
    async fn retry_failed(&self, max_retries: u32) -> DeliveryResult<u64>;

    /// Cancel an unclaimed (pending/retrying) row.
    async fn cancel(&self, id: Uuid) -> DeliveryResult<()>;

    /// Look up a single row.
    async fn get(&self, id: Uuid) -> DeliveryResult<Option<QueuedEmail>>;

    /// Per-status counts plus the future-scheduled backlog.
    async fn stats(&self) -> DeliveryResult<QueueStats>;

    /// Delete terminal (`sent`/`failed`) rows older than `older_than`.
    /// Returns the number of rows removed.
    async fn purge_old(&self, older_than: Duration) -> DeliveryResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn test_backoff_table() {
        // 1, 2, 4, 8, 16, 32 minutes, then capped at 60
        assert_eq!(backoff(0), minutes(1));
        assert_eq!(backoff(1), minutes(2));
        assert_eq!(backoff(2), minutes(4));
        assert_eq!(backoff(3), minutes(8));
        assert_eq!(backoff(4), minutes(16));
        assert_eq!(backoff(5), minutes(32));
        assert_eq!(backoff(6), minutes(60));
        assert_eq!(backoff(7), minutes(60));
        assert_eq!(backoff(100), minutes(60));
    }

    #[test]
    fn test_backoff_matches_power_of_two_below_cap() {
        for n in 0..=6u32 {
            let expected = minutes((1u64 << n).min(60));
            assert_eq!(backoff(n), expected, "attempt {}", n);
        }
    }

    fn row_with_retries(max_retries: u32) -> QueuedEmail {
        let message = EmailMessage::new("test@example.com", "Subject").with_text("Body");
        QueuedEmail::new(&message, max_retries).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_message() {
        let mut variables = serde_json::Map::new();
        variables.insert("user_name".to_string(), serde_json::json!("Ann"));

        let message = EmailMessage::new("a@example.com", "Subject")
            .with_to("b@example.com")
            .with_cc("c@example.com")
            .with_bcc("d@example.com")
            .with_text("text")
            .with_html("<p>html</p>")
            .with_attachment(crate::models::Attachment::new(
                "notes.txt",
                "text/plain",
                b"hello".to_vec(),
            ))
            .with_header("X-Test", "1")
            .with_tag("tag-a")
            .with_metadata("origin", "unit-test")
            .with_priority(7)
            .with_template("custom", variables);

        let row = QueuedEmail::new(&message, 3).unwrap();
        assert_eq!(row.decode().unwrap(), message);
    }

    #[test]
    fn test_failures_below_budget_keep_retrying() {
        let mut row = row_with_retries(3);
        row.claim();

        assert_eq!(
            row.record_failure("first", false, Utc::now()),
            QueueStatus::Retrying
        );
        row.claim();
        assert_eq!(
            row.record_failure("second", false, Utc::now()),
            QueueStatus::Retrying
        );
        assert_eq!(row.attempt_count, 2);
        assert!(row.scheduled_at.is_some());
    }

    #[test]
    fn test_exhausted_retries_end_failed() {
        let mut row = row_with_retries(3);

        for (i, error) in ["first", "second", "third"].iter().enumerate() {
            row.claim();
            let status = row.record_failure(error, false, Utc::now());
            if i < 2 {
                assert_eq!(status, QueueStatus::Retrying);
            } else {
                assert_eq!(status, QueueStatus::Failed);
            }
        }

        assert_eq!(row.status, QueueStatus::Failed);
        assert_eq!(row.attempt_count, 3);
        assert_eq!(row.last_error.as_deref(), Some("third"));
        // Terminal: no automatic path back to eligibility
        assert!(!row.is_eligible(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_permanent_failure_short_circuits() {
        let mut row = row_with_retries(3);
        row.claim();

        let status = row.record_failure("550 no such user", true, Utc::now());
        assert_eq!(status, QueueStatus::Failed);
        assert_eq!(row.attempt_count, 1);
    }

    #[test]
    fn test_retry_backoff_schedule() {
        let now = Utc::now();
        let mut row = row_with_retries(5);
        row.claim();
        row.record_failure("boom", false, now);

        // First failure: attempt 1, eligible again after 2 minutes
        let eligible_at = row.scheduled_at.unwrap();
        assert_eq!(eligible_at, now + chrono::Duration::minutes(2));
        assert!(!row.is_eligible(now));
        assert!(row.is_eligible(eligible_at));
    }

    #[test]
    fn test_cancel_only_unclaimed_rows() {
        let mut row = row_with_retries(3);
        assert!(row.cancel());
        assert_eq!(row.status, QueueStatus::Cancelled);

        let mut claimed = row_with_retries(3);
        claimed.claim();
        assert!(!claimed.cancel());
        assert_eq!(claimed.status, QueueStatus::Sending);
    }

    #[test]
    fn test_sent_is_terminal() {
        let mut row = row_with_retries(3);
        row.claim();
        row.record_sent(Some("provider-1".to_string()), Utc::now());

        assert_eq!(row.status, QueueStatus::Sent);
        assert!(row.status.is_terminal());
        assert!(row.sent_at.is_some());
        assert_eq!(row.provider_message_id.as_deref(), Some("provider-1"));
    }
}
