//! src/services/queue_service.rs
//!
//! QueueService — a durable, at-least-once work queue stored in SQLite.
//!
//! Receiving a message leases it: the message becomes invisible for the
//! visibility timeout, its receive count is incremented and it gets a fresh
//! receipt. A message that is neither acknowledged nor released before the
//! lease expires becomes visible again and is redelivered. Once a message
//! has been received more than `max_receive_count` times it is moved to the
//! dead-letter table on its next receive instead of being delivered again.

use crate::{
    models::queue_message::{DeadLetter, QueueMessage},
    services::retry::{Retryable, is_transient_sqlx},
};
use chrono::Utc;
use sqlx::{Executor, Sqlite, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("could not serialize message body: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        match self {
            QueueError::Sqlx(err) => is_transient_sqlx(err),
            QueueError::Serialize(_) => false,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a received message stays invisible to other consumers.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_receive_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 3,
        }
    }
}

#[derive(Clone)]
pub struct QueueService {
    db: SqlitePool,
    config: QueueConfig,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl QueueService {
    pub fn new(db: SqlitePool, config: QueueConfig) -> Self {
        Self { db, config }
    }

    /// Append a message and return its id. It is visible immediately.
    pub async fn enqueue(&self, body: &str) -> QueueResult<String> {
        Self::insert_message(&self.db, body).await
    }

    /// Append a message through `executor`, which may be an open transaction
    /// so the message commits together with other writes.
    pub async fn insert_message<'e, E>(executor: E, body: &str) -> QueueResult<String>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let message_id = Uuid::new_v4().to_string();
        let now = now_millis();

        sqlx::query(
            "INSERT INTO queue_messages (message_id, body, receive_count, receipt, visible_at, sent_at)
             VALUES (?, ?, 0, NULL, ?, ?)",
        )
        .bind(&message_id)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await?;

        debug!(%message_id, "enqueued message");
        Ok(message_id)
    }

    /// Lease the oldest visible message, or return `None` when the queue has
    /// nothing to deliver right now.
    ///
    /// Leasing is a single `UPDATE … RETURNING`, so concurrent consumers never
    /// receive the same visible message.
    pub async fn receive(&self) -> QueueResult<Option<QueueMessage>> {
        loop {
            let now = now_millis();
            let leased = sqlx::query_as::<_, QueueMessage>(
                r#"
                UPDATE queue_messages
                SET receive_count = receive_count + 1,
                    receipt = ?,
                    visible_at = ?
                WHERE message_id = (
                    SELECT message_id FROM queue_messages
                    WHERE visible_at <= ?
                    ORDER BY sent_at ASC, message_id ASC
                    LIMIT 1
                )
                RETURNING message_id, receipt, body, receive_count, sent_at
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(now + millis(self.config.visibility_timeout))
            .bind(now)
            .fetch_optional(&self.db)
            .await?;

            let Some(message) = leased else {
                return Ok(None);
            };

            if message.receive_count > i64::from(self.config.max_receive_count) {
                warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "max receive count exceeded, moving to dead-letter channel"
                );
                self.dead_letter(&message.receipt, "max receive count exceeded")
                    .await?;
                continue;
            }

            return Ok(Some(message));
        }
    }

    /// Delete a delivered message. Returns `false` when the receipt is stale,
    /// i.e. the lease expired and the message was redelivered or removed.
    pub async fn ack(&self, receipt: &str) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE receipt = ?")
            .bind(receipt)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// End a lease early; the message becomes visible again after `delay`.
    pub async fn release(&self, receipt: &str, delay: Duration) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE queue_messages SET receipt = NULL, visible_at = ? WHERE receipt = ?",
        )
        .bind(now_millis() + millis(delay))
        .bind(receipt)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a leased message to the dead-letter channel.
    pub async fn dead_letter(&self, receipt: &str, reason: &str) -> QueueResult<bool> {
        let mut tx = self.db.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letters
                (message_id, body, receive_count, reason, sent_at, dead_lettered_at)
            SELECT message_id, body, receive_count, ?, sent_at, ?
            FROM queue_messages WHERE receipt = ?
            "#,
        )
        .bind(reason)
        .bind(now_millis())
        .bind(receipt)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM queue_messages WHERE receipt = ?")
            .bind(receipt)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(moved.rows_affected() > 0)
    }

    pub async fn list_dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            "SELECT message_id, body, receive_count, reason, sent_at, dead_lettered_at
             FROM dead_letters ORDER BY dead_lettered_at ASC, message_id ASC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Put every dead letter back on the queue with a fresh receive count.
    /// Returns the number of messages moved.
    pub async fn redrive_dead_letters(&self) -> QueueResult<u64> {
        let mut tx = self.db.begin().await?;
        let now = now_millis();

        let moved = sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_messages
                (message_id, body, receive_count, receipt, visible_at, sent_at)
            SELECT message_id, body, 0, NULL, ?, ?
            FROM dead_letters
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dead_letters").execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(moved.rows_affected())
    }

    /// Messages waiting or in flight.
    pub async fn depth(&self) -> QueueResult<i64> {
        let depth = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.db)
            .await?;
        Ok(depth)
    }
}
