//! Worker system: drains the task queue and drives sessions to completion.
//!
//! - `step`: the `Stepper` trait and its context/outcome types
//! - `heartbeat`: keeps visibility and the claim lease alive mid-run
//! - `worker`: claim, then step with retries until finalized and acknowledged

pub mod heartbeat;
pub mod step;
pub mod worker;

pub use step::{StepContext, StepOutcome, StepStatus, Stepper};
pub use worker::{DeliveryOutcome, Worker, WorkerConfig, WorkerDeps, spawn_workers};
