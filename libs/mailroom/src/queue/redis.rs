//! Redis-backed durable queue.
//!
//! Layout, per configured key prefix:
//! - `{prefix}:item:{id}` — JSON row
//! - `{prefix}:ready` — zset of claimable ids, scored priority-desc then
//!   created-asc
//! - `{prefix}:delayed` — zset of future-scheduled ids, scored by
//!   eligibility time in epoch millis
//! - `{prefix}:status:{status}` — per-status id sets (stats, recovery, purge)
//! - `{prefix}:scores` — id → ready score, so delayed rows can be promoted
//!   without re-reading the row
//!
//! The dequeue claim runs as one Lua script: promote due delayed ids into
//! the ready set, pop up to `limit` ids. Redis executes scripts atomically,
//! so two workers can never claim the same row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{EmailMessage, QueueStats};
use crate::queue::{EmailQueue, QueueStatus, QueuedEmail};

const CLAIM_SCRIPT: &str = r#"
local ready = KEYS[1]
local delayed = KEYS[2]
local scores = KEYS[3]
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])

local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now)
for i = 1, #due do
    local score = redis.call('HGET', scores, due[i])
    if score then
        redis.call('ZADD', ready, score, due[i])
    end
    redis.call('ZREM', delayed, due[i])
end

local claimed = redis.call('ZRANGE', ready, 0, limit - 1)
for i = 1, #claimed do
    redis.call('ZREM', ready, claimed[i])
end
return claimed
"#;

// Stride between priority bands in the ready score. 2^42 sits above any
// epoch-millis timestamp this code will see, and keeps the composite inside
// f64's exact-integer range for priorities in [-1023, 1023].
const PRIORITY_STRIDE: f64 = 4_398_046_511_104.0;

/// Composite ready-set score: lower scores dequeue first, so higher
/// priorities map to lower bands and ties break on creation time.
fn ready_score(priority: i32, created_at: DateTime<Utc>) -> f64 {
    let band = 1024.0 - f64::from(priority.clamp(-1023, 1023));
    band * PRIORITY_STRIDE + created_at.timestamp_millis() as f64
}

/// Durable queue over Redis.
pub struct RedisQueue {
    redis: ConnectionManager,
    prefix: String,
    claim: Script,
}

impl RedisQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, "mailroom:queue")
    }

    pub fn with_prefix(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            claim: Script::new(CLAIM_SCRIPT),
        }
    }

    fn item_key(&self, id: Uuid) -> String {
        format!("{}:item:{}", self.prefix, id)
    }

    fn status_key(&self, status: QueueStatus) -> String {
        format!("{}:status:{}", self.prefix, status)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn scores_key(&self) -> String {
        format!("{}:scores", self.prefix)
    }

    async fn load(&self, id: Uuid) -> DeliveryResult<Option<QueuedEmail>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.item_key(id)).await?;
        raw.map(|payload| serde_json::from_str(&payload).map_err(DeliveryError::from))
            .transpose()
    }

    async fn load_required(&self, id: Uuid) -> DeliveryResult<QueuedEmail> {
        self.load(id)
            .await?
            .ok_or_else(|| DeliveryError::QueueUnavailable(format!("no queued email {id}")))
    }

    async fn store(&self, row: &QueuedEmail) -> DeliveryResult<()> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(row)?;
        let _: () = conn.set(self.item_key(row.id), payload).await?;
        Ok(())
    }
}

#[async_trait]
impl EmailQueue for RedisQueue {
    async fn enqueue(&self, message: &EmailMessage, max_retries: u32) -> DeliveryResult<Uuid> {
        let row = QueuedEmail::new(message, max_retries)?;
        let payload = serde_json::to_string(&row)?;
        let id = row.id.to_string();
        let score = ready_score(row.priority, row.created_at);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.item_key(row.id), &payload)
            .ignore()
            .hset(self.scores_key(), &id, score)
            .ignore()
            .sadd(self.status_key(QueueStatus::Pending), &id)
            .ignore();
        match row.scheduled_at {
            Some(at) if at > Utc::now() => {
                pipe.zadd(self.delayed_key(), &id, at.timestamp_millis())
                    .ignore();
            }
            _ => {
                pipe.zadd(self.ready_key(), &id, score).ignore();
            }
        }

        let mut conn = self.redis.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(message_id = %row.id, priority = row.priority, "Enqueued email");
        Ok(row.id)
    }

    async fn dequeue(&self, limit: usize) -> DeliveryResult<Vec<QueuedEmail>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = self
            .claim
            .key(self.ready_key())
            .key(self.delayed_key())
            .key(self.scores_key())
            .arg(Utc::now().timestamp_millis())
            .arg(limit as i64)
            .invoke_async(&mut conn)
            .await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let id = Uuid::parse_str(&raw_id).map_err(|e| {
                DeliveryError::QueueUnavailable(format!("malformed queue id {raw_id}: {e}"))
            })?;
            let Some(mut row) = self.load(id).await? else {
                warn!(message_id = %id, "Claimed id with no backing row");
                continue;
            };
            let previous = row.status;
            row.claim();
            self.store(&row).await?;
            let _: bool = conn
                .smove(
                    self.status_key(previous),
                    self.status_key(QueueStatus::Sending),
                    &raw_id,
                )
                .await?;
            claimed.push(row);
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid, provider_message_id: Option<String>) -> DeliveryResult<()> {
        let mut row = self.load_required(id).await?;
        let previous = row.status;
        row.record_sent(provider_message_id, Utc::now());
        self.store(&row).await?;

        let raw_id = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .smove(
                self.status_key(previous),
                self.status_key(QueueStatus::Sent),
                &raw_id,
            )
            .ignore()
            .hdel(self.scores_key(), &raw_id)
            .ignore()
            .zrem(self.ready_key(), &raw_id)
            .ignore()
            .zrem(self.delayed_key(), &raw_id)
            .ignore();
        let mut conn = self.redis.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        info!(message_id = %id, "Email marked sent");
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &DeliveryError) -> DeliveryResult<QueueStatus> {
        let mut row = self.load_required(id).await?;
        let previous = row.status;
        let status = row.record_failure(&error.to_string(), error.is_permanent(), Utc::now());
        self.store(&row).await?;

        let raw_id = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .smove(self.status_key(previous), self.status_key(status), &raw_id)
            .ignore();
        match (status, row.scheduled_at) {
            (QueueStatus::Retrying, Some(at)) => {
                pipe.zadd(self.delayed_key(), &raw_id, at.timestamp_millis())
                    .ignore();
            }
            _ => {
                pipe.hdel(self.scores_key(), &raw_id)
                    .ignore()
                    .zrem(self.ready_key(), &raw_id)
                    .ignore()
                    .zrem(self.delayed_key(), &raw_id)
                    .ignore();
            }
        }
        let mut conn = self.redis.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        warn!(
            message_id = %id,
            attempt = row.attempt_count,
            status = %status,
            error = %error,
            "Email send failed"
        );
        Ok(status)
    }

    async fn retry_failed(&self, max_retries: u32) -> DeliveryResult<u64> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(self.status_key(QueueStatus::Failed)).await?;

        let mut reset = 0u64;
        for raw_id in ids {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            let Some(mut row) = self.load(id).await? else {
                continue;
            };
            if row.status != QueueStatus::Failed || row.attempt_count >= max_retries {
                continue;
            }
            row.reset_for_retry();
            self.store(&row).await?;

            let score = ready_score(row.priority, row.created_at);
            let mut pipe = redis::pipe();
            pipe.atomic()
                .smove(
                    self.status_key(QueueStatus::Failed),
                    self.status_key(QueueStatus::Pending),
                    &raw_id,
                )
                .ignore()
                .hset(self.scores_key(), &raw_id, score)
                .ignore()
                .zadd(self.ready_key(), &raw_id, score)
                .ignore();
            let _: () = pipe.query_async(&mut conn).await?;
            reset += 1;
        }

        if reset > 0 {
            info!(count = reset, "Reset failed emails for retry");
        }
        Ok(reset)
    }

    async fn cancel(&self, id: Uuid) -> DeliveryResult<()> {
        let mut row = self.load_required(id).await?;
        let previous = row.status;
        if !row.cancel() {
            return Err(DeliveryError::Validation(format!(
                "cannot cancel message in status {previous}"
            )));
        }
        self.store(&row).await?;

        let raw_id = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .smove(
                self.status_key(previous),
                self.status_key(QueueStatus::Cancelled),
                &raw_id,
            )
            .ignore()
            .hdel(self.scores_key(), &raw_id)
            .ignore()
            .zrem(self.ready_key(), &raw_id)
            .ignore()
            .zrem(self.delayed_key(), &raw_id)
            .ignore();
        let mut conn = self.redis.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        info!(message_id = %id, "Email cancelled");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DeliveryResult<Option<QueuedEmail>> {
        self.load(id).await
    }

    async fn stats(&self) -> DeliveryResult<QueueStats> {
        let mut conn = self.redis.clone();
        let mut stats = QueueStats::default();
        for status in QueueStatus::ALL {
            let count: u64 = conn.scard(self.status_key(status)).await?;
            match status {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::Sending => stats.sending = count,
                QueueStatus::Sent => stats.sent = count,
                QueueStatus::Failed => stats.failed = count,
                QueueStatus::Retrying => stats.retrying = count,
                QueueStatus::Cancelled => stats.cancelled = count,
            }
        }
        // Everything still in the delayed zset past `now` is future-scheduled
        let now = Utc::now().timestamp_millis();
        stats.scheduled = conn
            .zcount(self.delayed_key(), format!("({now}"), "+inf")
            .await?;
        Ok(stats)
    }

    async fn purge_old(&self, older_than: Duration) -> DeliveryResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
        let mut conn = self.redis.clone();
        let mut removed = 0u64;

        for status in [QueueStatus::Sent, QueueStatus::Failed] {
            let ids: Vec<String> = conn.smembers(self.status_key(status)).await?;
            for raw_id in ids {
                let Ok(id) = Uuid::parse_str(&raw_id) else {
                    continue;
                };
                let Some(row) = self.load(id).await? else {
                    let _: u64 = conn.srem(self.status_key(status), &raw_id).await?;
                    continue;
                };
                if row.created_at >= cutoff {
                    continue;
                }
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .del(self.item_key(id))
                    .ignore()
                    .srem(self.status_key(status), &raw_id)
                    .ignore()
                    .hdel(self.scores_key(), &raw_id)
                    .ignore();
                let _: () = pipe.query_async(&mut conn).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(count = removed, "Purged old queue rows");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_scores_lower() {
        let now = Utc::now();
        assert!(ready_score(10, now) < ready_score(0, now));
        assert!(ready_score(0, now) < ready_score(-10, now));
    }

    #[test]
    fn test_older_rows_score_lower_within_a_priority() {
        let older = Utc::now() - chrono::Duration::minutes(5);
        let newer = Utc::now();
        assert!(ready_score(3, older) < ready_score(3, newer));
    }

    #[test]
    fn test_priority_dominates_age() {
        // A much older low-priority row still sorts after a new high-priority one
        let old = Utc::now() - chrono::Duration::days(30);
        assert!(ready_score(1, Utc::now()) < ready_score(0, old));
    }

    #[test]
    fn test_extreme_priorities_are_clamped() {
        let now = Utc::now();
        assert_eq!(ready_score(i32::MAX, now), ready_score(1023, now));
        assert_eq!(ready_score(i32::MIN, now), ready_score(-1023, now));
    }
}
