//! Session status views for callers.
//!
//! `poll()` reads the store and is always authoritative. `subscribe()` yields
//! a snapshot followed by events and later snapshots as they commit, ending
//! after the terminal snapshot. It wakes on the in-process change feed and
//! falls back to a poll tick, which also picks up writes from other
//! processes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::feed::{ChangeFeed, SessionChange};
use crate::error::{Error, SessionError};
use crate::events::Event;
use crate::session::{Session, SessionStatus};
use crate::store::{EventLog, SessionStore};

/// A session and its full ordered trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTrace {
    pub session: Session,
    pub events: Vec<Event>,
}

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    Snapshot { session: Session },
    Event { event: Event },
}

#[derive(Clone)]
pub struct StatusNotifier {
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventLog>,
    feed: ChangeFeed,
    poll_interval: Duration,
}

impl StatusNotifier {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        events: Arc<dyn EventLog>,
        feed: ChangeFeed,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sessions,
            events,
            feed,
            poll_interval,
        }
    }

    /// Current session record plus every event so far.
    pub async fn poll(&self, session_id: Uuid) -> Result<SessionTrace, Error> {
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound { id: session_id })?;
        let events = self.events.list_events(session_id).await?;
        Ok(SessionTrace { session, events })
    }

    /// Live updates for one session. Dropping the stream cancels it.
    pub fn subscribe(&self, session_id: Uuid) -> BoxStream<'static, SessionUpdate> {
        let tail = Tail {
            session_id,
            sessions: Arc::clone(&self.sessions),
            events: Arc::clone(&self.events),
            // Subscribe before the first read so no commit falls in between.
            rx: self.feed.subscribe(),
            poll_interval: self.poll_interval,
            cursor: 0,
            last_seen: None,
            pending: VecDeque::new(),
            started: false,
            finished: false,
        };

        stream::unfold(tail, |mut tail| async move {
            loop {
                if let Some(update) = tail.pending.pop_front() {
                    return Some((update, tail));
                }
                if tail.finished {
                    return None;
                }
                if tail.started {
                    tail.wait_for_change().await;
                }
                if let Err(e) = tail.refresh().await {
                    warn!(session_id = %tail.session_id, error = %e, "Subscription read failed, closing");
                    return None;
                }
            }
        })
        .boxed()
    }
}

/// Per-subscription cursor state.
struct Tail {
    session_id: Uuid,
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventLog>,
    rx: broadcast::Receiver<SessionChange>,
    poll_interval: Duration,
    /// Highest event seq already yielded.
    cursor: i64,
    last_seen: Option<(SessionStatus, DateTime<Utc>)>,
    pending: VecDeque<SessionUpdate>,
    started: bool,
    finished: bool,
}

impl Tail {
    /// Block until this session changes or the poll tick fires.
    async fn wait_for_change(&mut self) {
        let tick = tokio::time::sleep(self.poll_interval);
        tokio::pin!(tick);
        loop {
            tokio::select! {
                _ = &mut tick => return,
                change = self.rx.recv() => match change {
                    Ok(change) if change.session_id == self.session_id => return,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(session_id = %self.session_id, missed, "Subscription lagged, re-reading");
                        return;
                    }
                    Err(RecvError::Closed) => {
                        (&mut tick).await;
                        return;
                    }
                },
            }
        }
    }

    /// Read the session, then events past the cursor, and queue what is new.
    ///
    /// The session is read first: once it reads terminal every event has
    /// already committed, so the event read that follows is complete.
    ///
    /// A changed snapshot is placed among the new events by commit time:
    /// events written before the session's `updated_at` go ahead of it, the
    /// rest follow. A terminal snapshot always goes last.
    async fn refresh(&mut self) -> Result<(), Error> {
        let Some(session) = self.sessions.get_session(self.session_id).await? else {
            return Err(SessionError::NotFound {
                id: self.session_id,
            }
            .into());
        };
        let new_events = self
            .events
            .list_events_after(self.session_id, self.cursor)
            .await?;
        if let Some(last) = new_events.last() {
            self.cursor = self.cursor.max(last.seq);
        }

        let key = (session.status, session.updated_at);
        let changed = self.last_seen != Some(key);
        self.last_seen = Some(key);
        let terminal = session.is_terminal();

        let first = !self.started;
        self.started = true;

        if first {
            self.pending.push_back(SessionUpdate::Snapshot { session });
            self.push_events(new_events);
        } else if !changed {
            self.push_events(new_events);
        } else if terminal {
            self.push_events(new_events);
            self.pending.push_back(SessionUpdate::Snapshot { session });
        } else {
            let (before, after): (Vec<Event>, Vec<Event>) = new_events
                .into_iter()
                .partition(|event| event.created_at < session.updated_at);
            self.push_events(before);
            self.pending.push_back(SessionUpdate::Snapshot { session });
            self.push_events(after);
        }

        if terminal {
            self.finished = true;
        }
        Ok(())
    }

    fn push_events(&mut self, events: Vec<Event>) {
        self.pending
            .extend(events.into_iter().map(|event| SessionUpdate::Event { event }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, EventType};
    use crate::session::{ChatMessage, Metadata};
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<LibSqlBackend>, StatusNotifier) {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let notifier = StatusNotifier::new(
            backend.clone(),
            backend.clone(),
            backend.changes(),
            Duration::from_millis(200),
        );
        (backend, notifier)
    }

    #[tokio::test]
    async fn poll_returns_session_and_events() {
        let (db, notifier) = setup().await;
        let session = db
            .create_session(vec![ChatMessage::user("hi")], Metadata::new())
            .await
            .unwrap();
        db.append_event(session.id, &EventPayload::thinking("hmm"))
            .await
            .unwrap();

        let trace = notifier.poll(session.id).await.unwrap();
        assert_eq!(trace.session.id, session.id);
        assert_eq!(trace.events.len(), 1);
    }

    #[tokio::test]
    async fn poll_missing_session() {
        let (_db, notifier) = setup().await;
        let err = notifier.poll(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn subscribe_follows_session_to_completion() {
        let (db, notifier) = setup().await;
        let session_id = db.create_session(vec![], Metadata::new()).await.unwrap().id;
        let mut stream = notifier.subscribe(session_id);

        match stream.next().await {
            Some(SessionUpdate::Snapshot { session }) => {
                assert_eq!(session.id, session_id);
                assert_eq!(session.status, SessionStatus::Pending);
            }
            other => panic!("expected initial snapshot, got {other:?}"),
        }

        let writer = {
            let db = db.clone();
            tokio::spawn(async move {
                let claim = db
                    .claim_session(session_id, Duration::from_secs(60))
                    .await
                    .unwrap();
                db.append_claimed(&claim, &EventPayload::thinking("one"))
                    .await
                    .unwrap();
                db.append_claimed(&claim, &EventPayload::status_update("done", None))
                    .await
                    .unwrap();
                db.finalize_session(&claim, "42").await.unwrap();
            })
        };

        let updates: Vec<SessionUpdate> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        writer.await.unwrap();

        match updates.last() {
            Some(SessionUpdate::Snapshot { session }) => {
                assert_eq!(session.status, SessionStatus::Completed);
                assert_eq!(session.final_response.as_deref(), Some("42"));
            }
            other => panic!("expected terminal snapshot, got {other:?}"),
        }

        let event_types: Vec<EventType> = updates
            .iter()
            .filter_map(|u| match u {
                SessionUpdate::Event { event } => Some(event.event_type),
                _ => None,
            })
            .collect();
        assert_eq!(event_types, vec![EventType::Thinking, EventType::StatusUpdate]);
    }

    #[tokio::test]
    async fn claim_snapshot_precedes_events_written_under_it() {
        let (db, notifier) = setup().await;
        let session_id = db.create_session(vec![], Metadata::new()).await.unwrap().id;
        let mut stream = notifier.subscribe(session_id);
        assert!(matches!(
            stream.next().await,
            Some(SessionUpdate::Snapshot { session }) if session.status == SessionStatus::Pending
        ));

        // Both commit before the stream is polled again, so one refresh sees both.
        let claim = db
            .claim_session(session_id, Duration::from_secs(60))
            .await
            .unwrap();
        db.append_claimed(&claim, &EventPayload::thinking("working"))
            .await
            .unwrap();

        let next_two: Vec<SessionUpdate> = tokio::time::timeout(
            Duration::from_secs(5),
            stream.by_ref().take(2).collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert!(matches!(
            &next_two[0],
            SessionUpdate::Snapshot { session } if session.status == SessionStatus::Running
        ));
        assert!(matches!(
            &next_two[1],
            SessionUpdate::Event { event } if event.event_type == EventType::Thinking
        ));
    }

    #[tokio::test]
    async fn reclaim_snapshot_sits_between_generations() {
        let (db, notifier) = setup().await;
        let session_id = db.create_session(vec![], Metadata::new()).await.unwrap().id;
        let mut stream = notifier.subscribe(session_id);
        assert!(matches!(stream.next().await, Some(SessionUpdate::Snapshot { .. })));

        let stale = db
            .claim_session(session_id, Duration::from_millis(1))
            .await
            .unwrap();
        let mut updates: Vec<SessionUpdate> = stream.by_ref().take(1).collect().await;
        assert!(matches!(
            &updates[0],
            SessionUpdate::Snapshot { session } if session.execution_count == 1
        ));

        db.append_claimed(&stale, &EventPayload::thinking("first holder"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = db
            .claim_session(session_id, Duration::from_secs(60))
            .await
            .unwrap();
        db.append_claimed(&fresh, &EventPayload::thinking("second holder"))
            .await
            .unwrap();

        updates = tokio::time::timeout(
            Duration::from_secs(5),
            stream.by_ref().take(3).collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        let thought = |update: &SessionUpdate| match update {
            SessionUpdate::Event { event } => match event.payload() {
                Ok(EventPayload::Thinking(t)) => Some(t.content.clone()),
                _ => None,
            },
            _ => None,
        };
        assert_eq!(thought(&updates[0]).as_deref(), Some("first holder"));
        assert!(matches!(
            &updates[1],
            SessionUpdate::Snapshot { session } if session.execution_count == 2
        ));
        assert_eq!(thought(&updates[2]).as_deref(), Some("second holder"));
    }

    #[tokio::test]
    async fn subscribe_to_terminal_session_replays_and_ends() {
        let (db, notifier) = setup().await;
        let session = db.create_session(vec![], Metadata::new()).await.unwrap();
        let claim = db
            .claim_session(session.id, Duration::from_secs(60))
            .await
            .unwrap();
        db.append_claimed(&claim, &EventPayload::thinking("only"))
            .await
            .unwrap();
        db.fail_session(&claim, "boom").await.unwrap();

        let updates: Vec<SessionUpdate> = notifier.subscribe(session.id).collect().await;
        assert_eq!(updates.len(), 2);
        assert!(matches!(
            &updates[0],
            SessionUpdate::Snapshot { session } if session.status == SessionStatus::Failed
        ));
        assert!(matches!(&updates[1], SessionUpdate::Event { .. }));
    }

    #[tokio::test]
    async fn subscribe_to_missing_session_ends_immediately() {
        let (_db, notifier) = setup().await;
        let updates: Vec<SessionUpdate> = notifier.subscribe(Uuid::new_v4()).collect().await;
        assert!(updates.is_empty());
    }

    #[test]
    fn update_wire_form_is_tagged() {
        let session = Session::new(vec![], Metadata::new());
        let value = serde_json::to_value(SessionUpdate::Snapshot { session }).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["session"]["status"], "pending");
    }
}
