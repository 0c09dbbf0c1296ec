//! Event taxonomy: the closed set of things a session trace can record.
//!
//! `EventType` is the closed enumeration persisted in `events.event_type`.
//! `EventPayload` pairs each type with its typed `event_data` shape; it is
//! adjacently tagged so the wire form is
//! `{"event_type": "tool_call", "event_data": {...}}`. Free-form tool and
//! agent shapes live inside `serde_json::Value` fields, never by reusing
//! another type's payload.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventError;

/// Closed enumeration of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ToolCall,
    ToolResult,
    Verification,
    Retry,
    Thinking,
    StatusUpdate,
    Error,
    ContextCompression,
    AgentCreated,
    AgentThought,
    DiscussionTurn,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        Self::ToolCall,
        Self::ToolResult,
        Self::Verification,
        Self::Retry,
        Self::Thinking,
        Self::StatusUpdate,
        Self::Error,
        Self::ContextCompression,
        Self::AgentCreated,
        Self::AgentThought,
        Self::DiscussionTurn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Verification => "verification",
            Self::Retry => "retry",
            Self::Thinking => "thinking",
            Self::StatusUpdate => "status_update",
            Self::Error => "error",
            Self::ContextCompression => "context_compression",
            Self::AgentCreated => "agent_created",
            Self::AgentThought => "agent_thought",
            Self::DiscussionTurn => "discussion_turn",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// What was checked (a call id, an agent id, "final_answer", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retry {
    pub step: u32,
    /// 1-based retry number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thinking {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Fraction complete in `0.0..=1.0`, when the stepper can estimate it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
}

/// Where an `error` event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry bound exhausted on a transient failure.
    Transient,
    /// The stepping function reported an unrecoverable failure.
    Fatal,
    /// The watchdog forced an over-age session to failed.
    Watchdog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    /// Whether the session was failed because of this error.
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCompression {
    pub messages_before: usize,
    pub messages_after: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCreated {
    pub agent_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// The agent specification as produced by the stepper.
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThought {
    pub agent_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionTurn {
    pub agent_id: String,
    pub round: u32,
    pub content: String,
}

/// Typed `event_data`, keyed by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "event_data", rename_all = "snake_case")]
pub enum EventPayload {
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Verification(Verification),
    Retry(Retry),
    Thinking(Thinking),
    StatusUpdate(StatusUpdate),
    Error(StepFailure),
    ContextCompression(ContextCompression),
    AgentCreated(AgentCreated),
    AgentThought(AgentThought),
    DiscussionTurn(DiscussionTurn),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ToolCall(_) => EventType::ToolCall,
            Self::ToolResult(_) => EventType::ToolResult,
            Self::Verification(_) => EventType::Verification,
            Self::Retry(_) => EventType::Retry,
            Self::Thinking(_) => EventType::Thinking,
            Self::StatusUpdate(_) => EventType::StatusUpdate,
            Self::Error(_) => EventType::Error,
            Self::ContextCompression(_) => EventType::ContextCompression,
            Self::AgentCreated(_) => EventType::AgentCreated,
            Self::AgentThought(_) => EventType::AgentThought,
            Self::DiscussionTurn(_) => EventType::DiscussionTurn,
        }
    }

    /// Validate an untyped `(event_type, event_data)` pair.
    pub fn from_parts(event_type: &str, event_data: serde_json::Value) -> Result<Self, EventError> {
        let kind: EventType = event_type.parse()?;
        serde_json::from_value(serde_json::json!({
            "event_type": kind.as_str(),
            "event_data": event_data,
        }))
        .map_err(|e| EventError::InvalidPayload {
            event_type: kind.to_string(),
            reason: e.to_string(),
        })
    }

    /// Split into the persisted `(event_type, event_data)` pair.
    pub fn into_parts(&self) -> Result<(EventType, serde_json::Value), EventError> {
        let mut value = serde_json::to_value(self).map_err(|e| EventError::InvalidPayload {
            event_type: self.event_type().to_string(),
            reason: e.to_string(),
        })?;
        let data = value
            .get_mut("event_data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok((self.event_type(), data))
    }

    // ── Constructors for the common shapes ──────────────────────────

    pub fn tool_call(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self::ToolCall(ToolCall {
            tool_name: tool_name.into(),
            call_id: None,
            arguments,
        })
    }

    pub fn tool_result(tool_name: impl Into<String>, success: bool, output: serde_json::Value) -> Self {
        Self::ToolResult(ToolResult {
            tool_name: tool_name.into(),
            call_id: None,
            success,
            output,
        })
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::Thinking(Thinking {
            content: content.into(),
            agent_id: None,
        })
    }

    pub fn status_update(status: impl Into<String>, message: Option<String>) -> Self {
        Self::StatusUpdate(StatusUpdate {
            status: status.into(),
            message,
            progress: None,
        })
    }

    pub fn retry(step: u32, attempt: u32, max_attempts: u32, reason: impl Into<String>) -> Self {
        Self::Retry(Retry {
            step,
            attempt,
            max_attempts,
            reason: reason.into(),
        })
    }

    pub fn error(message: impl Into<String>, kind: ErrorKind, step: Option<u32>, terminal: bool) -> Self {
        Self::Error(StepFailure {
            message: message.into(),
            kind,
            step,
            terminal,
        })
    }
}

/// One persisted, immutable entry of a session's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Store-assigned insertion id; breaks `created_at` ties.
    pub seq: i64,
    pub session_id: Uuid,
    pub event_type: EventType,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Decode the typed payload.
    pub fn payload(&self) -> Result<EventPayload, EventError> {
        EventPayload::from_parts(self.event_type.as_str(), self.event_data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_names_are_stable() {
        for kind in EventType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<EventType>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_event_type_rejected() {
        let err = EventPayload::from_parts("final_answer", json!({})).unwrap_err();
        assert!(matches!(err, EventError::UnknownType(ref t) if t == "final_answer"));
    }

    #[test]
    fn payload_shape_validated_per_type() {
        // tool_result requires `success`
        let err = EventPayload::from_parts("tool_result", json!({"tool_name": "calc"})).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload { ref event_type, .. } if event_type == "tool_result"));

        let ok = EventPayload::from_parts(
            "tool_result",
            json!({"tool_name": "calc", "success": true, "output": 42}),
        )
        .unwrap();
        assert_eq!(ok.event_type(), EventType::ToolResult);
    }

    #[test]
    fn into_parts_splits_type_and_data() {
        let payload = EventPayload::tool_call("search", json!({"q": "rust"}));
        let (kind, data) = payload.into_parts().unwrap();
        assert_eq!(kind, EventType::ToolCall);
        assert_eq!(data["tool_name"], "search");
        assert_eq!(data["arguments"]["q"], "rust");
        assert!(data.get("call_id").is_none());
        assert_eq!(EventPayload::from_parts(kind.as_str(), data).unwrap(), payload);
    }

    #[test]
    fn agent_payloads_keep_free_form_spec() {
        let payload = EventPayload::from_parts(
            "agent_created",
            json!({
                "agent_id": "a1",
                "name": "Skeptic",
                "spec": {"persona": "contrarian", "tools": ["search"]}
            }),
        )
        .unwrap();
        match payload {
            EventPayload::AgentCreated(agent) => {
                assert_eq!(agent.spec["tools"][0], "search");
                assert!(agent.role.is_none());
            }
            other => panic!("expected AgentCreated, got {other:?}"),
        }
    }

    #[test]
    fn error_payload_wire_form() {
        let payload = EventPayload::error("boom", ErrorKind::Fatal, Some(2), true);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["event_type"], "error");
        assert_eq!(value["event_data"]["kind"], "fatal");
        assert_eq!(value["event_data"]["terminal"], true);
    }
}
