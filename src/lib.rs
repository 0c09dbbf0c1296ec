//! Session orchestrator: durable queue, worker state machine and
//! append-only event log for long-running LLM sessions.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod llm;
pub mod notify;
pub mod queue;
pub mod session;
pub mod store;
pub mod watchdog;
pub mod worker;
