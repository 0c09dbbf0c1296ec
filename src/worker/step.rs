//! The stepping function the worker drives, and what it sees and returns.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StepError;
use crate::events::{Event, EventPayload};
use crate::session::{ChatMessage, Metadata};

/// Everything a step gets to look at.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: Uuid,
    /// The session's input messages.
    pub messages: Vec<ChatMessage>,
    /// Every event appended to this session so far, including those from
    /// earlier claims and any `retry` events of the current step.
    pub history: Vec<Event>,
    /// 0-based step index within this claim.
    pub step: u32,
    /// 0 on the first try of a step, incremented per retry.
    pub attempt: u32,
    pub metadata: Metadata,
}

/// Where the session goes after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    Continue,
    Done(String),
    /// Unrecoverable; the session fails with this message.
    Failed(String),
}

/// One step's result: the events to record, then where to go next.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub events: Vec<EventPayload>,
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn next(events: Vec<EventPayload>) -> Self {
        Self {
            events,
            status: StepStatus::Continue,
        }
    }

    pub fn done(events: Vec<EventPayload>, result: impl Into<String>) -> Self {
        Self {
            events,
            status: StepStatus::Done(result.into()),
        }
    }

    pub fn failed(events: Vec<EventPayload>, error: impl Into<String>) -> Self {
        Self {
            events,
            status: StepStatus::Failed(error.into()),
        }
    }
}

/// External stepping function: decides the next tool call, sub-agent,
/// discussion round or answer.
///
/// A `StepError::Transient` is retried in place with backoff; anything else
/// ends the session.
#[async_trait]
pub trait Stepper: Send + Sync {
    async fn step(&self, ctx: &StepContext) -> Result<StepOutcome, StepError>;
}
