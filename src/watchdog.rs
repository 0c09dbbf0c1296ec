//! Watchdog: periodic out-of-band sweep over sessions and dead letters.
//!
//! - Sessions older than the maximum age are forced to failed, claimed or not.
//! - Running sessions with an expired lease are reported as stuck.
//! - Dead letters are surfaced or resubmitted per `DeadLetterPolicy`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{DeadLetterPolicy, OrchestratorConfig};
use crate::error::Error;
use crate::events::{ErrorKind, EventPayload};
use crate::queue::{DeadLetter, TaskQueue};
use crate::store::{EventLog, SessionStore};

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub max_session_age: Duration,
    pub interval: Duration,
    pub dead_letter_policy: DeadLetterPolicy,
}

impl WatchdogConfig {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_session_age: config.max_session_age,
            interval: config.watchdog_interval,
            dead_letter_policy: config.dead_letter_policy,
        }
    }
}

/// What one sweep found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogReport {
    /// Sessions this sweep forced to failed.
    pub forced_failed: Vec<Uuid>,
    /// Running sessions whose lease had expired.
    pub stuck: Vec<Uuid>,
    /// Sessions whose dead-lettered message was surfaced for an operator.
    pub dead_lettered: Vec<Uuid>,
    /// Sessions whose dead-lettered message was put back in the queue.
    pub resubmitted: Vec<Uuid>,
}

impl WatchdogReport {
    pub fn is_clean(&self) -> bool {
        self.forced_failed.is_empty()
            && self.stuck.is_empty()
            && self.dead_lettered.is_empty()
            && self.resubmitted.is_empty()
    }
}

pub struct Watchdog {
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventLog>,
    queue: Arc<dyn TaskQueue>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        events: Arc<dyn EventLog>,
        queue: Arc<dyn TaskQueue>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            sessions,
            events,
            queue,
            config,
        }
    }

    /// Run one sweep.
    pub async fn sweep(&self) -> Result<WatchdogReport, Error> {
        let now = Utc::now();
        let mut report = WatchdogReport::default();

        self.expire_overdue(now, &mut report).await?;

        for session in self.sessions.list_stuck_sessions(now).await? {
            warn!(
                session_id = %session.id,
                execution_count = session.execution_count,
                lease_expires_at = ?session.lease_expires_at,
                "Session stuck: lease expired without finalize"
            );
            report.stuck.push(session.id);
        }

        for letter in self.queue.dead_letters().await? {
            self.handle_dead_letter(&letter, &mut report).await?;
        }

        if !report.is_clean() {
            info!(
                forced_failed = report.forced_failed.len(),
                stuck = report.stuck.len(),
                dead_lettered = report.dead_lettered.len(),
                resubmitted = report.resubmitted.len(),
                "Watchdog sweep complete"
            );
        }
        Ok(report)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>, report: &mut WatchdogReport) -> Result<(), Error> {
        let cutoff = TimeDelta::from_std(self.config.max_session_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        for session in self.sessions.list_overdue_sessions(cutoff).await? {
            let message = format!(
                "session exceeded maximum age of {}s",
                self.config.max_session_age.as_secs()
            );
            // Only the sweep that wins the transition records the error event.
            if !self
                .sessions
                .force_fail_session(session.id, &message, cutoff)
                .await?
            {
                continue;
            }
            if let Err(e) = self
                .events
                .append_event(
                    session.id,
                    &EventPayload::error(&message, ErrorKind::Watchdog, None, true),
                )
                .await
            {
                error!(
                    session_id = %session.id,
                    error = %e,
                    "Forced session to failed but could not record the error event"
                );
            }
            warn!(
                session_id = %session.id,
                previous_status = %session.status,
                "Watchdog forced session to failed"
            );
            report.forced_failed.push(session.id);
        }
        Ok(())
    }

    async fn handle_dead_letter(&self, letter: &DeadLetter, report: &mut WatchdogReport) -> Result<(), Error> {
        let session_id = letter.message.session_id;
        let session = self.sessions.get_session(session_id).await?;

        if session.as_ref().is_some_and(|s| s.is_terminal()) {
            // The holder finished after its redeliveries ran out.
            info!(
                session_id = %session_id,
                message_id = %letter.message.message_id,
                receive_count = letter.receive_count,
                "Dead letter for a finished session, discarding"
            );
            self.queue
                .mark_dead_letter_handled(letter.message.message_id)
                .await?;
            return Ok(());
        }

        if let DeadLetterPolicy::Resubmit { max_resubmissions } = self.config.dead_letter_policy {
            if session.is_some() && letter.resubmissions < max_resubmissions {
                self.queue.resubmit(letter.message.message_id).await?;
                info!(
                    session_id = %session_id,
                    message_id = %letter.message.message_id,
                    resubmission = letter.resubmissions + 1,
                    max_resubmissions,
                    "Dead letter resubmitted"
                );
                report.resubmitted.push(session_id);
                return Ok(());
            }
        }

        error!(
            session_id = %session_id,
            message_id = %letter.message.message_id,
            receive_count = letter.receive_count,
            resubmissions = letter.resubmissions,
            dead_lettered_at = %letter.dead_lettered_at,
            "Message dead-lettered, needs attention"
        );
        self.queue
            .mark_dead_letter_handled(letter.message.message_id)
            .await?;
        report.dead_lettered.push(session_id);
        Ok(())
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            info!(interval_secs = self.config.interval.as_secs(), "Watchdog started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Watchdog sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Watchdog stopped");
        })
    }
}
