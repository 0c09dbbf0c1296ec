//! Sessions: the durable record each orchestration request lives in.
//!
//! - `state`: status machine (Pending → Queued → Running → Completed/Failed)
//! - `model`: `Session`, input `ChatMessage`s and the `Claim` token

pub mod model;
pub mod state;

pub use model::{ChatMessage, Claim, Metadata, Session, THREAD_ID_KEY};
pub use state::SessionStatus;
