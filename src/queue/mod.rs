//! At-least-once task queue carrying session ids from the dispatcher to
//! workers.
//!
//! A received message stays invisible for the visibility timeout; unless it is
//! acknowledged in that window it becomes receivable again. After
//! `max_receive_count` deliveries it moves to the dead-letter set instead.

pub mod libsql_queue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

pub use libsql_queue::LibSqlQueue;

/// Message body: just the session to work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub session_id: Uuid,
}

/// Opaque token for one specific delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(pub String);

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: QueueMessage,
    pub handle: ReceiptHandle,
    /// 1 on first delivery.
    pub receive_count: u32,
    /// How many times the dead-letter policy put this message back.
    pub resubmissions: u32,
}

/// A message that exhausted its deliveries without being acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub receive_count: u32,
    pub resubmissions: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(120),
            max_receive_count: 5,
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a session id.
    async fn publish(&self, session_id: Uuid) -> Result<QueueMessage, QueueError>;

    /// Take the next visible message, if any. Never blocks.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Delete the message behind this delivery.
    ///
    /// Fails with `ReceiptExpired` if the message was redelivered since.
    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError>;

    /// Keep an in-flight delivery invisible for another `extension`.
    async fn extend(&self, handle: &ReceiptHandle, extension: Duration) -> Result<(), QueueError>;

    /// Dead letters not yet handled by the watchdog.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Stop reporting a dead letter.
    async fn mark_dead_letter_handled(&self, message_id: Uuid) -> Result<(), QueueError>;

    /// Put a dead letter back in the queue with a fresh receive budget.
    async fn resubmit(&self, message_id: Uuid) -> Result<(), QueueError>;
}
