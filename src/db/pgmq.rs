//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.set_vt and pgmq.metrics.

use crate::error::Result;
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    /// How many times the message has been read, this read included.
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub message: serde_json::Value,
}

fn count(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(self.pool())
            .await?;
        count(queue, "create");
        Ok(())
    }

    /// Send a message. Returns the message id.
    pub async fn send_to_queue(&self, queue: &str, payload: &serde_json::Value) -> Result<i64> {
        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue)
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        count(queue, "send");
        Ok(msg_id)
    }

    /// Read the next visible message and hide it for `vt_seconds`.
    pub async fn read_from_queue(&self, queue: &str, vt_seconds: i32) -> Result<Option<PgmqMessage>> {
        let row: Option<(i64, i32, DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(queue)
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await?;

        count(queue, if row.is_some() { "read" } else { "read_empty" });
        Ok(row.map(|(msg_id, read_ct, enqueued_at, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            message,
        }))
    }

    /// Archive a message (moves it to the archive table).
    pub async fn archive_message(&self, queue: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        count(queue, "archive");
        Ok(())
    }

    /// Make a read message visible again after `vt_seconds` (0 = now).
    pub async fn set_visibility(&self, queue: &str, msg_id: i64, vt_seconds: i32) -> Result<()> {
        sqlx::query("SELECT pgmq.set_vt($1, $2, $3)")
            .bind(queue)
            .bind(msg_id)
            .bind(vt_seconds)
            .execute(self.pool())
            .await?;
        count(queue, "set_vt");
        Ok(())
    }

    /// Messages currently in the queue, visible or not.
    pub async fn queue_length(&self, queue: &str) -> Result<u64> {
        let (length,): (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue)
            .fetch_one(self.pool())
            .await?;
        Ok(length.max(0) as u64)
    }
}
