//! Session status.
//!
//! Transitions are forward-only and enforced by the guarded updates in the
//! store: pending → queued → running → completed | failed, with
//! running → running on a reclaim after lease expiry.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created by the dispatcher, not yet published.
    Pending,
    /// Published to the task queue.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Finished with a final response.
    Completed,
    /// Finished with an error.
    Failed,
}

impl SessionStatus {
    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}
