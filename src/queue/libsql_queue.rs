//! Task queue on a libSQL table.
//!
//! Visibility is a millisecond timestamp per row. Receiving is a single
//! `UPDATE ... WHERE id = (SELECT ... LIMIT 1) RETURNING`, so two workers
//! (or two processes on the same file) can never receive the same delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::{debug, error};
use uuid::Uuid;

use super::{DeadLetter, Delivery, QueueMessage, QueueSettings, ReceiptHandle, TaskQueue};
use crate::error::{DatabaseError, QueueError};

pub struct LibSqlQueue {
    conn: Connection,
    settings: QueueSettings,
}

impl LibSqlQueue {
    /// Wrap a connection whose database already has the queue schema.
    pub fn new(conn: Connection, settings: QueueSettings) -> Self {
        Self { conn, settings }
    }

    /// Move visible messages that used up their deliveries to the dead-letter set.
    async fn sweep_exhausted(&self, now_ms: i64) -> Result<(), QueueError> {
        let mut rows = self
            .conn
            .query(
                "UPDATE queue_messages
                 SET dead_lettered_at_ms = ?1, receipt_handle = NULL
                 WHERE dead_lettered_at_ms IS NULL
                   AND visible_at_ms <= ?1
                   AND receive_count >= ?2
                 RETURNING id, session_id, receive_count",
                params![now_ms, i64::from(self.settings.max_receive_count)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sweep_exhausted: {e}")))?;

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("sweep_exhausted: {e}")))?
        {
            let message_id: String = row.get(0).unwrap_or_default();
            let session_id: String = row.get(1).unwrap_or_default();
            let receive_count: i64 = row.get(2).unwrap_or_default();
            error!(
                message_id = %message_id,
                session_id = %session_id,
                receive_count,
                "Message exhausted its deliveries, moved to dead letters"
            );
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2)
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("queue {column}: {e}")))
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

#[async_trait]
impl TaskQueue for LibSqlQueue {
    async fn publish(&self, session_id: Uuid) -> Result<QueueMessage, QueueError> {
        let message = QueueMessage {
            message_id: Uuid::new_v4(),
            session_id,
        };
        let now = now_ms();
        self.conn
            .execute(
                "INSERT INTO queue_messages (id, session_id, enqueued_at_ms, visible_at_ms)
                 VALUES (?1, ?2, ?3, ?3)",
                params![
                    message.message_id.to_string(),
                    session_id.to_string(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("publish: {e}")))?;

        debug!(message_id = %message.message_id, session_id = %session_id, "Message published");
        Ok(message)
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = now_ms();
        self.sweep_exhausted(now).await?;

        let handle = ReceiptHandle(Uuid::new_v4().to_string());
        let mut rows = self
            .conn
            .query(
                "UPDATE queue_messages
                 SET receive_count = receive_count + 1,
                     visible_at_ms = ?1,
                     receipt_handle = ?2
                 WHERE id = (
                     SELECT id FROM queue_messages
                     WHERE dead_lettered_at_ms IS NULL
                       AND visible_at_ms <= ?3
                       AND receive_count < ?4
                     ORDER BY enqueued_at_ms ASC, rowid ASC
                     LIMIT 1
                 )
                 RETURNING id, session_id, receive_count, resubmissions",
                params![
                    now + duration_ms(self.settings.visibility_timeout),
                    handle.0.clone(),
                    now,
                    i64::from(self.settings.max_receive_count)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("receive: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("receive: {e}")))?
        else {
            return Ok(None);
        };

        let q = |e: libsql::Error| DatabaseError::Query(format!("receive: {e}"));
        let message_id: String = row.get(0).map_err(q)?;
        let session_id: String = row.get(1).map_err(q)?;
        let receive_count: i64 = row.get(2).map_err(q)?;
        let resubmissions: i64 = row.get(3).map_err(q)?;

        let delivery = Delivery {
            message: QueueMessage {
                message_id: parse_uuid(&message_id, "id")?,
                session_id: parse_uuid(&session_id, "session_id")?,
            },
            handle,
            receive_count: to_u32(receive_count),
            resubmissions: to_u32(resubmissions),
        };
        debug!(
            message_id = %delivery.message.message_id,
            session_id = %delivery.message.session_id,
            receive_count = delivery.receive_count,
            "Message received"
        );
        Ok(Some(delivery))
    }

    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM queue_messages
                 WHERE receipt_handle = ?1 AND dead_lettered_at_ms IS NULL",
                params![handle.0.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("acknowledge: {e}")))?;

        if affected == 0 {
            return Err(QueueError::ReceiptExpired {
                handle: handle.0.clone(),
            });
        }
        Ok(())
    }

    async fn extend(&self, handle: &ReceiptHandle, extension: Duration) -> Result<(), QueueError> {
        let affected = self
            .conn
            .execute(
                "UPDATE queue_messages SET visible_at_ms = ?1
                 WHERE receipt_handle = ?2 AND dead_lettered_at_ms IS NULL",
                params![now_ms() + duration_ms(extension), handle.0.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("extend: {e}")))?;

        if affected == 0 {
            return Err(QueueError::ReceiptExpired {
                handle: handle.0.clone(),
            });
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        // Messages that ran out of deliveries get moved on the next receive;
        // sweep here too so an idle queue still surfaces them.
        self.sweep_exhausted(now_ms()).await?;

        let mut rows = self
            .conn
            .query(
                "SELECT id, session_id, receive_count, resubmissions, dead_lettered_at_ms
                 FROM queue_messages
                 WHERE dead_lettered_at_ms IS NOT NULL AND dead_letter_handled = 0
                 ORDER BY dead_lettered_at_ms ASC, rowid ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letters: {e}")))?;

        let mut letters = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letters: {e}")))?
        {
            let q = |e: libsql::Error| DatabaseError::Query(format!("dead_letters: {e}"));
            let message_id: String = row.get(0).map_err(q)?;
            let session_id: String = row.get(1).map_err(q)?;
            let receive_count: i64 = row.get(2).map_err(q)?;
            let resubmissions: i64 = row.get(3).map_err(q)?;
            let dead_lettered_at_ms: i64 = row.get(4).map_err(q)?;
            letters.push(DeadLetter {
                message: QueueMessage {
                    message_id: parse_uuid(&message_id, "id")?,
                    session_id: parse_uuid(&session_id, "session_id")?,
                },
                receive_count: to_u32(receive_count),
                resubmissions: to_u32(resubmissions),
                dead_lettered_at: DateTime::from_timestamp_millis(dead_lettered_at_ms)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            });
        }
        Ok(letters)
    }

    async fn mark_dead_letter_handled(&self, message_id: Uuid) -> Result<(), QueueError> {
        self.conn
            .execute(
                "UPDATE queue_messages SET dead_letter_handled = 1
                 WHERE id = ?1 AND dead_lettered_at_ms IS NOT NULL",
                params![message_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_dead_letter_handled: {e}")))?;
        Ok(())
    }

    async fn resubmit(&self, message_id: Uuid) -> Result<(), QueueError> {
        let affected = self
            .conn
            .execute(
                "UPDATE queue_messages
                 SET dead_lettered_at_ms = NULL,
                     dead_letter_handled = 0,
                     receive_count = 0,
                     resubmissions = resubmissions + 1,
                     visible_at_ms = ?1,
                     receipt_handle = NULL
                 WHERE id = ?2 AND dead_lettered_at_ms IS NOT NULL",
                params![now_ms(), message_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resubmit: {e}")))?;

        if affected > 0 {
            debug!(message_id = %message_id, "Dead letter resubmitted");
        }
        Ok(())
    }
}
