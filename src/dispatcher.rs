//! Dispatcher: turns a request into a pending session and a queue message.
//!
//! It never executes anything itself. The session record is written before the
//! message is published, so a worker can never receive an id it cannot load.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::TaskQueue;
use crate::session::{ChatMessage, Metadata, Session, THREAD_ID_KEY};
use crate::store::{SessionStore, ThreadStore};

#[derive(Clone)]
pub struct Dispatcher {
    sessions: Arc<dyn SessionStore>,
    queue: Arc<dyn TaskQueue>,
    threads: Arc<dyn ThreadStore>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        queue: Arc<dyn TaskQueue>,
        threads: Arc<dyn ThreadStore>,
    ) -> Self {
        Self {
            sessions,
            queue,
            threads,
        }
    }

    /// Create a session for `messages` and hand it to the workers.
    ///
    /// If publishing fails the session stays pending; the watchdog fails it
    /// once it exceeds the maximum age.
    pub async fn dispatch(&self, messages: Vec<ChatMessage>, metadata: Metadata) -> Result<Session> {
        if messages.is_empty() {
            return Err(Error::InvalidRequest(
                "a session needs at least one message".into(),
            ));
        }

        let session = self.sessions.create_session(messages, metadata).await?;
        if let Err(e) = self.queue.publish(session.id).await {
            warn!(session_id = %session.id, error = %e, "Publish failed, session left pending");
            return Err(e.into());
        }

        if !self.sessions.mark_queued(session.id).await? {
            // A worker got to it first.
            tracing::debug!(session_id = %session.id, "Session claimed before it was marked queued");
        }
        info!(
            session_id = %session.id,
            messages = session.messages.len(),
            "Session dispatched"
        );

        Ok(self
            .sessions
            .get_session(session.id)
            .await?
            .unwrap_or(session))
    }

    /// Dispatch the current context of a chat thread. The final response is
    /// delivered back to the thread.
    pub async fn dispatch_thread(&self, thread_id: Uuid, mut metadata: Metadata) -> Result<Session> {
        let messages = self.threads.load_context(thread_id).await?;
        if messages.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "thread {thread_id} has no messages"
            )));
        }
        metadata.insert(THREAD_ID_KEY.into(), thread_id.to_string().into());
        self.dispatch(messages, metadata).await
    }
}
