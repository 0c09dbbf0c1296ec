//! Error types for the session orchestrator.

use std::time::Duration;

use uuid::Uuid;

use crate::session::SessionStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Event log error: {0}")]
    Event(#[from] EventError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Session store errors.
///
/// `ClaimConflict`, `StaleFinalize` and `StaleClaim` are expected outcomes under
/// at-least-once delivery, not faults: callers match on them and drop the
/// delivery.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: Uuid },

    #[error("Session {id} cannot be claimed (status {status})")]
    ClaimConflict { id: Uuid, status: SessionStatus },

    #[error("Session {id} is no longer held by claim generation {generation}")]
    StaleFinalize { id: Uuid, generation: i64 },

    #[error("Claim generation {generation} on session {id} has been superseded")]
    StaleClaim { id: Uuid, generation: i64 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Event log errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Session {id} not found")]
    SessionNotFound { id: Uuid },

    #[error("Claim generation {generation} on session {id} has been superseded")]
    StaleClaim { id: Uuid, generation: i64 },

    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Receipt handle {handle} has expired or was already acknowledged")]
    ReceiptExpired { handle: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Failure reported by the external stepping function.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    /// Retried in place up to the configured bound.
    #[error("Transient step failure: {0}")]
    Transient(String),

    /// Aborts the session immediately.
    #[error("Fatal step failure: {0}")]
    Fatal(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
