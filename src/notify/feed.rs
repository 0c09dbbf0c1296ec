//! In-process change feed: a broadcast nudge fired after every committed
//! session transition or event append.
//!
//! Subscribers treat a nudge as "go re-read the store", never as the data
//! itself, so a lagged or missed nudge costs latency, not correctness.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Default broadcast channel capacity.
const DEFAULT_FEED_CAPACITY: usize = 1024;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The session row changed status or outcome.
    Session,
    /// An event with this `seq` was appended.
    Event { seq: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionChange {
    pub session_id: Uuid,
    pub kind: ChangeKind,
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<SessionChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.tx.subscribe()
    }

    /// Ok if nobody is listening.
    pub fn session_changed(&self, session_id: Uuid) {
        let _ = self.tx.send(SessionChange {
            session_id,
            kind: ChangeKind::Session,
        });
    }

    pub fn event_appended(&self, session_id: Uuid, seq: i64) {
        let _ = self.tx.send(SessionChange {
            session_id,
            kind: ChangeKind::Event { seq },
        });
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}
