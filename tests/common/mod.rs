//! Shared harness for the integration tests: an in-memory backend, a short
//! visibility window and a stepper that replays a script.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use session_orchestrator::dispatcher::Dispatcher;
use session_orchestrator::error::StepError;
use session_orchestrator::queue::{QueueSettings, TaskQueue};
use session_orchestrator::store::LibSqlBackend;
use session_orchestrator::worker::{StepContext, StepOutcome, Stepper, Worker, WorkerConfig, WorkerDeps};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Visibility window used by the harness queue.
pub const VISIBILITY: Duration = Duration::from_millis(150);

/// Stepper that answers each invocation with the next scripted result.
/// Once the script runs out it keeps returning `fallback`.
pub struct ScriptedStepper {
    script: Mutex<VecDeque<Result<StepOutcome, StepError>>>,
    fallback: Result<StepOutcome, StepError>,
    calls: Mutex<Vec<StepContext>>,
}

impl ScriptedStepper {
    pub fn new(script: Vec<Result<StepOutcome, StepError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Ok(StepOutcome::done(vec![], "done")),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Result<StepOutcome, StepError>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Contexts seen so far, in call order.
    pub fn calls(&self) -> Vec<StepContext> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Stepper for ScriptedStepper {
    async fn step(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.calls.lock().unwrap().push(ctx.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct Harness {
    pub db: Arc<LibSqlBackend>,
    pub queue: Arc<dyn TaskQueue>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(QueueSettings {
            visibility_timeout: VISIBILITY,
            max_receive_count: 5,
        })
        .await
    }

    pub async fn with_settings(settings: QueueSettings) -> Self {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue: Arc<dyn TaskQueue> = Arc::new(db.task_queue(settings));
        let dispatcher = Dispatcher::new(db.clone(), queue.clone(), db.clone());
        Self {
            db,
            queue,
            dispatcher,
        }
    }

    pub fn deps(&self, stepper: Arc<dyn Stepper>) -> WorkerDeps {
        WorkerDeps {
            sessions: self.db.clone(),
            events: self.db.clone(),
            queue: self.queue.clone(),
            threads: self.db.clone(),
            stepper,
        }
    }

    pub fn worker(&self, stepper: Arc<dyn Stepper>) -> Worker {
        Worker::new(self.deps(stepper), worker_config())
    }
}

/// Retries without backoff, lease longer than any test.
pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        visibility_timeout: Duration::from_secs(30),
        renew_interval: Duration::from_secs(10),
        max_step_retries: 3,
        retry_base_delay: Duration::ZERO,
        max_steps: 20,
        poll_interval: Duration::from_millis(10),
    }
}
