//! Session record, input messages and claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::SessionStatus;

/// Free-form session metadata (e.g. the originating thread).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key holding the originating thread id.
pub const THREAD_ID_KEY: &str = "thread_id";

/// One entry of the ordered input context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Durable record of one orchestration request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub execution_count: i64,
    pub messages: Vec<ChatMessage>,
    pub final_response: Option<String>,
    pub error: Option<String>,
    pub metadata: Metadata,
    /// When the current claim expires unless the holder renews it.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Build a fresh pending session.
    pub fn new(messages: Vec<ChatMessage>, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            execution_count: 0,
            messages,
            final_response: None,
            error: None,
            metadata,
            lease_expires_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The originating thread, when the dispatcher recorded one.
    pub fn thread_id(&self) -> Option<Uuid> {
        self.metadata
            .get(THREAD_ID_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Proof of a successful claim.
///
/// `generation` is the `execution_count` written by the claim. A later claim
/// bumps the count and silently invalidates this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub session_id: Uuid,
    pub generation: i64,
    pub lease_expires_at: DateTime<Utc>,
}
