//! Status notification: the change feed plus read-side views of a session.
//!
//! - `feed`: in-process broadcast of "something changed" nudges
//! - `notifier`: `poll()` and `subscribe()` over the store

pub mod feed;
pub mod notifier;

pub use feed::{ChangeFeed, ChangeKind, SessionChange};
pub use notifier::{SessionTrace, SessionUpdate, StatusNotifier};
