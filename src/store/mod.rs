//! Persistence layer: libSQL-backed sessions, event log and chat threads.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{EventLog, SessionStore, ThreadStore};
