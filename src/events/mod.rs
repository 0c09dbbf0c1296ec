//! Append-only event log entries and their closed taxonomy.

pub mod model;

pub use model::{ErrorKind, Event, EventPayload, EventType};
