//! In-memory queue backend for tests and local development.
//!
//! Same externally observable semantics as the Redis backend; the claim is
//! atomic because the whole dequeue runs under one mutex guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{EmailMessage, QueueStats};
use crate::queue::{EmailQueue, QueueStatus, QueuedEmail};

/// Mutex-guarded map of queued rows.
pub struct MemoryQueue {
    rows: Arc<Mutex<HashMap<Uuid, QueuedEmail>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of rows currently held, regardless of status.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailQueue for MemoryQueue {
    async fn enqueue(&self, message: &EmailMessage, max_retries: u32) -> DeliveryResult<Uuid> {
        let row = QueuedEmail::new(message, max_retries)?;
        let id = row.id;
        self.rows.lock().await.insert(id, row);
        debug!(message_id = %id, "Enqueued email");
        Ok(id)
    }

    async fn dequeue(&self, limit: usize) -> DeliveryResult<Vec<QueuedEmail>> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();

        let mut eligible: Vec<Uuid> = rows
            .values()
            .filter(|row| row.is_eligible(now))
            .map(|row| row.id)
            .collect();
        // Priority descending, then oldest first
        eligible.sort_by(|a, b| {
            let (ra, rb) = (&rows[a], &rows[b]);
            rb.priority
                .cmp(&ra.priority)
                .then(ra.created_at.cmp(&rb.created_at))
        });
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(row) = rows.get_mut(&id) {
                row.claim();
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid, provider_message_id: Option<String>) -> DeliveryResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| DeliveryError::QueueUnavailable(format!("no queued email {id}")))?;
        row.record_sent(provider_message_id, Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &DeliveryError) -> DeliveryResult<QueueStatus> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| DeliveryError::QueueUnavailable(format!("no queued email {id}")))?;
        Ok(row.record_failure(&error.to_string(), error.is_permanent(), Utc::now()))
    }

    async fn retry_failed(&self, max_retries: u32) -> DeliveryResult<u64> {
        let mut rows = self.rows.lock().await;
        let mut reset = 0;
        for row in rows.values_mut() {
            if row.status == QueueStatus::Failed && row.attempt_count < max_retries {
                row.reset_for_retry();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn cancel(&self, id: Uuid) -> DeliveryResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| DeliveryError::QueueUnavailable(format!("no queued email {id}")))?;
        if row.cancel() {
            Ok(())
        } else {
            Err(DeliveryError::Validation(format!(
                "cannot cancel message in status {}",
                row.status
            )))
        }
    }

    async fn get(&self, id: Uuid) -> DeliveryResult<Option<QueuedEmail>> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn stats(&self) -> DeliveryResult<QueueStats> {
        let rows = self.rows.lock().await;
        let now = Utc::now();
        let mut stats = QueueStats::default();
        for row in rows.values() {
            match row.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Sending => stats.sending += 1,
                QueueStatus::Sent => stats.sent += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Retrying => stats.retrying += 1,
                QueueStatus::Cancelled => stats.cancelled += 1,
            }
            if matches!(row.status, QueueStatus::Pending | QueueStatus::Retrying)
                && row.scheduled_at.is_some_and(|at| at > now)
            {
                stats.scheduled += 1;
            }
        }
        Ok(stats)
    }

    async fn purge_old(&self, older_than: Duration) -> DeliveryResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| {
            !(matches!(row.status, QueueStatus::Sent | QueueStatus::Failed)
                && row.created_at < cutoff)
        });
        Ok((before - rows.len()) as u64)
    }
}
