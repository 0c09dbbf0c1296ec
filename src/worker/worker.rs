//! Per-delivery orchestration loop.
//!
//! receive → claim → step until done (events appended under the claim) →
//! finalize or fail → acknowledge. Losing the claim at any point stops the
//! loop without touching the session or the message again.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Error, EventError, SessionError, StepError};
use crate::events::{ErrorKind, Event, EventPayload};
use crate::queue::{Delivery, TaskQueue};
use crate::session::{Claim, Session};
use crate::store::{EventLog, SessionStore, ThreadStore};
use crate::worker::heartbeat::Heartbeat;
use crate::worker::step::{StepContext, StepOutcome, StepStatus, Stepper};

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventLog>,
    pub queue: Arc<dyn TaskQueue>,
    pub threads: Arc<dyn ThreadStore>,
    pub stepper: Arc<dyn Stepper>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Claim lease and visibility extension per heartbeat.
    pub visibility_timeout: Duration,
    pub renew_interval: Duration,
    pub max_step_retries: u32,
    pub retry_base_delay: Duration,
    pub max_steps: u32,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl WorkerConfig {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout,
            renew_interval: config.renew_interval(),
            max_step_retries: config.max_step_retries,
            retry_base_delay: config.retry_base_delay,
            max_steps: config.max_steps,
            poll_interval: config.poll_interval,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Session completed; message acknowledged.
    Completed,
    /// Session failed; message acknowledged.
    Failed,
    /// Nothing was done with the session. `reason` says why.
    Dropped { reason: String },
    /// The claim was superseded mid-run; the message was left alone.
    ClaimLost,
}

/// Why execution stopped before reaching a terminal write.
enum Interrupt {
    /// Another claim superseded ours.
    Lost(String),
    /// Store or queue failure; leave the message for redelivery.
    Infra(Error),
}

impl From<EventError> for Interrupt {
    fn from(e: EventError) -> Self {
        match e {
            EventError::StaleClaim { .. } | EventError::SessionNotFound { .. } => {
                Self::Lost(e.to_string())
            }
            other => Self::Infra(other.into()),
        }
    }
}

impl From<SessionError> for Interrupt {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::StaleFinalize { .. }
            | SessionError::StaleClaim { .. }
            | SessionError::NotFound { .. } => Self::Lost(e.to_string()),
            other => Self::Infra(other.into()),
        }
    }
}

/// How the stepping loop ended.
enum Termination {
    Done(String),
    Failed {
        message: String,
        kind: ErrorKind,
        step: Option<u32>,
    },
}

/// Worker that drains deliveries from the task queue.
pub struct Worker {
    name: String,
    deps: WorkerDeps,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(deps: WorkerDeps, config: WorkerConfig) -> Self {
        Self {
            name: "worker".to_string(),
            deps,
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Receive and handle at most one delivery.
    pub async fn poll_once(&self) -> Result<Option<DeliveryOutcome>, Error> {
        let Some(delivery) = self.deps.queue.receive().await? else {
            return Ok(None);
        };
        Ok(Some(self.handle_delivery(delivery).await))
    }

    /// Drain the queue until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once().await {
                Ok(Some(outcome)) => {
                    debug!(worker = %self.name, ?outcome, "Delivery handled");
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker = %self.name, error = %e, "Queue receive failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.name, "Worker stopped");
    }

    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let session_id = delivery.message.session_id;
        let claim = match self
            .deps
            .sessions
            .claim_session(session_id, self.config.visibility_timeout)
            .await
        {
            Ok(claim) => claim,
            Err(SessionError::ClaimConflict { status, .. }) if status.is_terminal() => {
                debug!(session_id = %session_id, %status, "Redelivery of finished session, acknowledging");
                self.acknowledge(&delivery).await;
                return DeliveryOutcome::Dropped {
                    reason: format!("session already {status}"),
                };
            }
            Err(SessionError::ClaimConflict { status, .. }) => {
                info!(session_id = %session_id, %status, "Session held by another worker, skipping");
                return DeliveryOutcome::Dropped {
                    reason: "claimed by another worker".into(),
                };
            }
            Err(SessionError::NotFound { .. }) => {
                warn!(session_id = %session_id, "Message for unknown session, acknowledging");
                self.acknowledge(&delivery).await;
                return DeliveryOutcome::Dropped {
                    reason: "session not found".into(),
                };
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Claim failed");
                return DeliveryOutcome::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        info!(
            worker = %self.name,
            session_id = %session_id,
            generation = claim.generation,
            receive_count = delivery.receive_count,
            "Session claimed"
        );

        let heartbeat = Heartbeat::start(
            Arc::clone(&self.deps.sessions),
            Arc::clone(&self.deps.queue),
            delivery.handle.clone(),
            claim,
            self.config.renew_interval,
            self.config.visibility_timeout,
        );
        let result = self.execute(&claim, &heartbeat).await;
        drop(heartbeat);

        match result {
            Ok((session, true)) => {
                info!(session_id = %session_id, generation = claim.generation, "Session completed");
                self.acknowledge(&delivery).await;
                self.deliver_to_thread(&session).await;
                DeliveryOutcome::Completed
            }
            Ok((_, false)) => {
                self.acknowledge(&delivery).await;
                DeliveryOutcome::Failed
            }
            Err(Interrupt::Lost(reason)) => {
                warn!(
                    session_id = %session_id,
                    generation = claim.generation,
                    reason = %reason,
                    "Claim lost, abandoning delivery"
                );
                DeliveryOutcome::ClaimLost
            }
            Err(Interrupt::Infra(e)) => {
                error!(
                    session_id = %session_id,
                    generation = claim.generation,
                    error = %e,
                    "Processing interrupted, leaving message for redelivery"
                );
                DeliveryOutcome::Dropped {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Run the session under `claim` through to a terminal write.
    /// Returns the resolved session and whether it completed.
    async fn execute(&self, claim: &Claim, heartbeat: &Heartbeat) -> Result<(Session, bool), Interrupt> {
        let termination = self.step_loop(claim, heartbeat).await?;
        if heartbeat.is_lost() {
            return Err(Interrupt::Lost("lease renewal rejected".into()));
        }

        match termination {
            Termination::Done(result) => {
                let session = self.deps.sessions.finalize_session(claim, &result).await?;
                Ok((session, true))
            }
            Termination::Failed {
                message,
                kind,
                step,
            } => {
                self.deps
                    .events
                    .append_claimed(claim, &EventPayload::error(&message, kind, step, true))
                    .await?;
                let session = self.deps.sessions.fail_session(claim, &message).await?;
                error!(
                    session_id = %claim.session_id,
                    generation = claim.generation,
                    error = %message,
                    "Session failed"
                );
                Ok((session, false))
            }
        }
    }

    async fn step_loop(&self, claim: &Claim, heartbeat: &Heartbeat) -> Result<Termination, Interrupt> {
        let session = self
            .deps
            .sessions
            .get_session(claim.session_id)
            .await?
            .ok_or_else(|| Interrupt::Lost("session disappeared".into()))?;
        let mut history = self.deps.events.list_events(claim.session_id).await?;

        let mut step: u32 = 0;
        loop {
            if heartbeat.is_lost() {
                return Err(Interrupt::Lost("lease renewal rejected".into()));
            }
            if step >= self.config.max_steps {
                return Ok(Termination::Failed {
                    message: format!("exceeded the maximum of {} steps", self.config.max_steps),
                    kind: ErrorKind::Fatal,
                    step: Some(step),
                });
            }

            let outcome = match self.step_with_retries(claim, &session, &mut history, step).await? {
                Ok(outcome) => outcome,
                Err(termination) => return Ok(termination),
            };

            for payload in &outcome.events {
                let event = self.deps.events.append_claimed(claim, payload).await?;
                history.push(event);
            }
            debug!(
                session_id = %claim.session_id,
                step,
                events = outcome.events.len(),
                "Step recorded"
            );

            match outcome.status {
                StepStatus::Continue => step += 1,
                StepStatus::Done(result) => return Ok(Termination::Done(result)),
                StepStatus::Failed(message) => {
                    return Ok(Termination::Failed {
                        message,
                        kind: ErrorKind::Fatal,
                        step: Some(step),
                    });
                }
            }
        }
    }

    /// Invoke the stepper, retrying transient failures in place.
    ///
    /// Each retry is recorded as a `retry` event before the backoff sleep.
    async fn step_with_retries(
        &self,
        claim: &Claim,
        session: &Session,
        history: &mut Vec<Event>,
        step: u32,
    ) -> Result<Result<StepOutcome, Termination>, Interrupt> {
        let max_retries = self.config.max_step_retries;
        let mut attempt: u32 = 0;
        loop {
            let ctx = StepContext {
                session_id: session.id,
                messages: session.messages.clone(),
                history: history.clone(),
                step,
                attempt,
                metadata: session.metadata.clone(),
            };

            match self.deps.stepper.step(&ctx).await {
                Ok(outcome) => return Ok(Ok(outcome)),
                Err(StepError::Transient(reason)) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        session_id = %session.id,
                        step,
                        attempt,
                        max_attempts = max_retries,
                        reason = %reason,
                        "Transient step failure, retrying"
                    );
                    let event = self
                        .deps
                        .events
                        .append_claimed(claim, &EventPayload::retry(step, attempt, max_retries, &reason))
                        .await?;
                    history.push(event);
                    tokio::time::sleep(backoff_delay(self.config.retry_base_delay, attempt - 1)).await;
                }
                Err(StepError::Transient(reason)) => {
                    return Ok(Err(Termination::Failed {
                        message: format!("step {step} failed after {max_retries} retries: {reason}"),
                        kind: ErrorKind::Transient,
                        step: Some(step),
                    }));
                }
                Err(StepError::Fatal(reason)) => {
                    return Ok(Err(Termination::Failed {
                        message: reason,
                        kind: ErrorKind::Fatal,
                        step: Some(step),
                    }));
                }
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        if let Err(e) = self.deps.queue.acknowledge(&delivery.handle).await {
            warn!(
                session_id = %delivery.message.session_id,
                error = %e,
                "Failed to acknowledge message"
            );
        }
    }

    async fn deliver_to_thread(&self, session: &Session) {
        let (Some(thread_id), Some(response)) = (session.thread_id(), session.final_response.as_deref())
        else {
            return;
        };
        match self.deps.threads.deliver_response(thread_id, response).await {
            Ok(()) => debug!(session_id = %session.id, thread_id = %thread_id, "Response delivered"),
            Err(e) => warn!(
                session_id = %session.id,
                thread_id = %thread_id,
                error = %e,
                "Failed to deliver response to thread"
            ),
        }
    }
}

/// `base * 2^attempt` plus up to 50% random jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let delay = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_ms = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Spawn `concurrency` delivery loops sharing `deps`.
pub fn spawn_workers(
    deps: WorkerDeps,
    config: WorkerConfig,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|i| {
            let worker = Worker::new(deps.clone(), config.clone()).with_name(format!("worker-{i}"));
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
