//! Backend-agnostic store interfaces for sessions, events and threads.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, EventError, SessionError};
use crate::events::{Event, EventPayload};
use crate::session::{ChatMessage, Claim, Metadata, Session};

/// Durable session records with compare-and-set transitions.
///
/// Every mutating call is a single conditional statement against the
/// session row; that row is the only coordination point between workers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new pending session.
    async fn create_session(
        &self,
        messages: Vec<ChatMessage>,
        metadata: Metadata,
    ) -> Result<Session, SessionError>;

    /// Read a session. Never mutates.
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, SessionError>;

    /// pending → queued. Returns false if the session already moved on.
    async fn mark_queued(&self, id: Uuid) -> Result<bool, SessionError>;

    /// Atomically take exclusive processing rights.
    ///
    /// Succeeds for pending/queued sessions and for running sessions whose
    /// lease has expired. Sets running, bumps `execution_count` and starts a
    /// lease of `lease` length.
    async fn claim_session(&self, id: Uuid, lease: Duration) -> Result<Claim, SessionError>;

    /// Push the lease of a still-current claim forward.
    async fn renew_lease(&self, claim: &Claim, lease: Duration) -> Result<Claim, SessionError>;

    /// running → completed, only for the current claim.
    async fn finalize_session(&self, claim: &Claim, result: &str) -> Result<Session, SessionError>;

    /// running → failed, only for the current claim.
    async fn fail_session(&self, claim: &Claim, error: &str) -> Result<Session, SessionError>;

    /// Watchdog path: fail a non-terminal session created before `created_before`,
    /// with or without a claim. Returns false if it resolved in the meantime.
    async fn force_fail_session(
        &self,
        id: Uuid,
        error: &str,
        created_before: DateTime<Utc>,
    ) -> Result<bool, SessionError>;

    /// Running sessions whose lease expired at or before `now`.
    async fn list_stuck_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, SessionError>;

    /// Non-terminal sessions created before `created_before`.
    async fn list_overdue_sessions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Session>, SessionError>;
}

/// Append-only per-session event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event. Fails only if the session does not exist.
    async fn append_event(&self, session_id: Uuid, payload: &EventPayload) -> Result<Event, EventError>;

    /// Append on behalf of a claim holder. The insert happens only if the
    /// claim is still current, checked in the same statement.
    async fn append_claimed(&self, claim: &Claim, payload: &EventPayload) -> Result<Event, EventError>;

    /// All events of a session, ordered by `created_at` then `seq`.
    async fn list_events(&self, session_id: Uuid) -> Result<Vec<Event>, EventError>;

    /// Events with `seq` greater than `after_seq`, same ordering.
    async fn list_events_after(&self, session_id: Uuid, after_seq: i64) -> Result<Vec<Event>, EventError>;
}

/// The chat thread store the orchestrator reads context from and delivers
/// final responses to.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Ordered conversation context of a thread.
    async fn load_context(&self, thread_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError>;

    /// Append the assistant's final response to a thread.
    async fn deliver_response(&self, thread_id: Uuid, content: &str) -> Result<(), DatabaseError>;
}
