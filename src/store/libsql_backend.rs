//! libSQL backend for sessions, the event log and chat threads.
//!
//! Every transition is one conditional `UPDATE ... RETURNING` (or
//! `INSERT ... SELECT ... WHERE EXISTS`) so concurrent workers, in this
//! process or another one sharing the file, race on the row and never on
//! read-then-write sequences. Committed changes are announced on the
//! [`ChangeFeed`] afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, EventError, SessionError};
use crate::events::{Event, EventPayload, EventType};
use crate::notify::ChangeFeed;
use crate::queue::{LibSqlQueue, QueueSettings};
use crate::session::{ChatMessage, Claim, Metadata, Session, SessionStatus};
use crate::store::migrations;
use crate::store::traits::{EventLog, SessionStore, ThreadStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    changes: ChangeFeed,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Several processes may share the file; wait for the writer lock
        // instead of failing immediately.
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            changes: ChangeFeed::default(),
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Handle to the change feed this backend publishes to.
    pub fn changes(&self) -> ChangeFeed {
        self.changes.clone()
    }

    /// A task queue sharing this database.
    pub fn task_queue(&self, settings: QueueSettings) -> LibSqlQueue {
        LibSqlQueue::new(self.conn.clone(), settings)
    }

    /// Append a message to a chat thread, creating the thread if needed.
    pub async fn add_thread_message(
        &self,
        thread_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = format_ts(Utc::now());
        conn.execute(
            "INSERT INTO conversations (id, started_at, last_activity)
             VALUES (?1, ?2, ?2)
             ON CONFLICT (id) DO UPDATE SET last_activity = ?2",
            params![thread_id.to_string(), now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("ensure_conversation: {e}")))?;

        conn.execute(
            "INSERT INTO conversation_messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                thread_id.to_string(),
                role,
                content,
                now
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_thread_message: {e}")))?;

        Ok(())
    }

    async fn session_exists(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("session_exists: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("session_exists: {e}")))?;
        Ok(row.is_some())
    }

    async fn query_sessions(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }

    async fn query_events(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Event>, EventError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    /// Why a guarded session update matched nothing.
    async fn stale_or_missing(&self, claim: &Claim) -> SessionError {
        match self.session_exists(claim.session_id).await {
            Ok(true) => SessionError::StaleFinalize {
                id: claim.session_id,
                generation: claim.generation,
            },
            Ok(false) => SessionError::NotFound {
                id: claim.session_id,
            },
            Err(e) => SessionError::Database(e),
        }
    }

    /// Shared body of finalize/fail: a generation-guarded terminal write.
    async fn resolve_claim(
        &self,
        claim: &Claim,
        status: SessionStatus,
        final_response: Option<&str>,
        error: Option<&str>,
    ) -> Result<Session, SessionError> {
        let now = format_ts(Utc::now());
        let sql = format!(
            "UPDATE sessions
             SET status = ?1, final_response = ?2, error = ?3, updated_at = ?4,
                 lease_expires_at_ms = NULL
             WHERE id = ?5 AND status = 'running' AND execution_count = ?6
             RETURNING {SESSION_COLUMNS}"
        );
        let mut rows = self
            .conn()
            .query(
                &sql,
                params![
                    status.as_str(),
                    opt_text(final_response),
                    opt_text(error),
                    now,
                    claim.session_id.to_string(),
                    claim.generation
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_claim: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_claim: {e}")))?;
        let session = match row {
            Some(row) => row_to_session(&row)?,
            None => {
                drop(rows);
                return Err(self.stale_or_missing(claim).await);
            }
        };
        drop(rows);

        debug!(
            session_id = %session.id,
            generation = claim.generation,
            status = %session.status,
            "Session resolved"
        );
        self.changes.session_changed(session.id);
        Ok(session)
    }

    /// Single-statement conditional insert shared by both append paths.
    /// With a generation, the session must still be running under it.
    async fn insert_event(
        &self,
        session_id: Uuid,
        payload: &EventPayload,
        generation: Option<i64>,
    ) -> Result<Option<Event>, EventError> {
        let (event_type, event_data) = payload.into_parts()?;
        let data_str = serde_json::to_string(&event_data)
            .map_err(|e| DatabaseError::Serialization(format!("event_data: {e}")))?;
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let sql = "INSERT INTO events (id, session_id, event_type, event_data, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE EXISTS (
                 SELECT 1 FROM sessions
                 WHERE id = ?2
                   AND (?6 IS NULL OR (status = 'running' AND execution_count = ?6))
             )
             RETURNING seq";
        let generation = generation.map_or(libsql::Value::Null, libsql::Value::Integer);
        let mut rows = self
            .conn()
            .query(
                sql,
                params![
                    id.to_string(),
                    session_id.to_string(),
                    event_type.as_str(),
                    data_str,
                    format_ts(created_at),
                    generation
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let seq: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;
        drop(rows);

        self.changes.event_appended(session_id, seq);
        Ok(Some(Event {
            id,
            seq,
            session_id,
            event_type,
            event_data,
            created_at,
        }))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text. Fixed-width micros so lexical order matches time order.
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(value: Option<&str>) -> libsql::Value {
    value.map_or(libsql::Value::Null, |s| libsql::Value::Text(s.to_string()))
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Lease deadline in epoch milliseconds.
fn lease_deadline_ms(now: DateTime<Utc>, lease: Duration) -> i64 {
    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2);
    now.timestamp_millis().saturating_add(lease_ms)
}

const SESSION_COLUMNS: &str = "id, status, created_at, updated_at, started_at, execution_count, \
     messages, final_response, error, metadata, lease_expires_at_ms";

const EVENT_COLUMNS: &str = "seq, id, session_id, event_type, event_data, created_at";

fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("row_to_session column {idx}: {e}")))
    };

    let id_str = get_text(0)?;
    let status_str = get_text(1)?;
    let messages_str = get_text(6)?;
    let metadata_str = get_text(9)?;

    let status: SessionStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let messages: Vec<ChatMessage> = serde_json::from_str(&messages_str)
        .map_err(|e| DatabaseError::Serialization(format!("session messages: {e}")))?;
    let metadata: Metadata = serde_json::from_str(&metadata_str)
        .map_err(|e| DatabaseError::Serialization(format!("session metadata: {e}")))?;

    Ok(Session {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("session id: {e}")))?,
        status,
        created_at: parse_datetime(&get_text(2)?),
        updated_at: parse_datetime(&get_text(3)?),
        started_at: row.get::<String>(4).ok().map(|s| parse_datetime(&s)),
        execution_count: row.get::<i64>(5).unwrap_or(0),
        messages,
        final_response: row.get::<String>(7).ok(),
        error: row.get::<String>(8).ok(),
        metadata,
        lease_expires_at: row.get::<i64>(10).ok().map(ms_to_datetime),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<Event, EventError> {
    let q = |e: libsql::Error| DatabaseError::Query(format!("row_to_event: {e}"));

    let seq: i64 = row.get(0).map_err(q)?;
    let id_str: String = row.get(1).map_err(q)?;
    let session_str: String = row.get(2).map_err(q)?;
    let type_str: String = row.get(3).map_err(q)?;
    let data_str: String = row.get(4).map_err(q)?;
    let created_str: String = row.get(5).map_err(q)?;

    let event_type: EventType = type_str.parse()?;
    let event_data = serde_json::from_str(&data_str)
        .map_err(|e| DatabaseError::Serialization(format!("event_data: {e}")))?;

    Ok(Event {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("event id: {e}")))?,
        seq,
        session_id: Uuid::parse_str(&session_str)
            .map_err(|e| DatabaseError::Serialization(format!("event session_id: {e}")))?,
        event_type,
        event_data,
        created_at: parse_datetime(&created_str),
    })
}

// ── SessionStore ────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn create_session(
        &self,
        messages: Vec<ChatMessage>,
        metadata: Metadata,
    ) -> Result<Session, SessionError> {
        let session = Session::new(messages, metadata);
        let messages_str = serde_json::to_string(&session.messages)
            .map_err(|e| DatabaseError::Serialization(format!("session messages: {e}")))?;
        let metadata_str = serde_json::to_string(&session.metadata)
            .map_err(|e| DatabaseError::Serialization(format!("session metadata: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO sessions (id, status, created_at, updated_at, execution_count, messages, metadata)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    session.id.to_string(),
                    session.status.as_str(),
                    format_ts(session.created_at),
                    format_ts(session.updated_at),
                    messages_str,
                    metadata_str
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_session: {e}")))?;

        debug!(session_id = %session.id, "Session created");
        self.changes.session_changed(session.id);
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, SessionError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let mut sessions = self
            .query_sessions("get_session", &sql, params![id.to_string()])
            .await?;
        Ok(sessions.pop())
    }

    async fn mark_queued(&self, id: Uuid) -> Result<bool, SessionError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE sessions SET status = 'queued', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![format_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_queued: {e}")))?;

        if affected > 0 {
            self.changes.session_changed(id);
            return Ok(true);
        }
        if !self.session_exists(id).await? {
            return Err(SessionError::NotFound { id });
        }
        Ok(false)
    }

    async fn claim_session(&self, id: Uuid, lease: Duration) -> Result<Claim, SessionError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let deadline_ms = lease_deadline_ms(now, lease);
        let now_str = format_ts(now);

        let mut rows = self
            .conn()
            .query(
                "UPDATE sessions
                 SET status = 'running',
                     execution_count = execution_count + 1,
                     started_at = COALESCE(started_at, ?1),
                     updated_at = ?1,
                     lease_expires_at_ms = ?2
                 WHERE id = ?3
                   AND (status IN ('pending', 'queued')
                        OR (status = 'running'
                            AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?4)))
                 RETURNING execution_count",
                params![now_str, deadline_ms, id.to_string(), now_ms],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_session: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_session: {e}")))?;
        let generation = match row {
            Some(row) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("claim_session: {e}")))?,
            None => {
                drop(rows);
                return match self.get_session(id).await? {
                    Some(session) => Err(SessionError::ClaimConflict {
                        id,
                        status: session.status,
                    }),
                    None => Err(SessionError::NotFound { id }),
                };
            }
        };
        drop(rows);

        debug!(session_id = %id, generation, "Session claimed");
        self.changes.session_changed(id);
        Ok(Claim {
            session_id: id,
            generation,
            lease_expires_at: ms_to_datetime(deadline_ms),
        })
    }

    async fn renew_lease(&self, claim: &Claim, lease: Duration) -> Result<Claim, SessionError> {
        let deadline_ms = lease_deadline_ms(Utc::now(), lease);
        let affected = self
            .conn()
            .execute(
                "UPDATE sessions SET lease_expires_at_ms = ?1
                 WHERE id = ?2 AND status = 'running' AND execution_count = ?3",
                params![deadline_ms, claim.session_id.to_string(), claim.generation],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("renew_lease: {e}")))?;

        if affected == 0 {
            if !self.session_exists(claim.session_id).await? {
                return Err(SessionError::NotFound {
                    id: claim.session_id,
                });
            }
            return Err(SessionError::StaleClaim {
                id: claim.session_id,
                generation: claim.generation,
            });
        }

        Ok(Claim {
            lease_expires_at: ms_to_datetime(deadline_ms),
            ..*claim
        })
    }

    async fn finalize_session(&self, claim: &Claim, result: &str) -> Result<Session, SessionError> {
        self.resolve_claim(claim, SessionStatus::Completed, Some(result), None)
            .await
    }

    async fn fail_session(&self, claim: &Claim, error: &str) -> Result<Session, SessionError> {
        self.resolve_claim(claim, SessionStatus::Failed, None, Some(error))
            .await
    }

    async fn force_fail_session(
        &self,
        id: Uuid,
        error: &str,
        created_before: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE sessions
                 SET status = 'failed', error = ?1, final_response = NULL, updated_at = ?2,
                     lease_expires_at_ms = NULL
                 WHERE id = ?3
                   AND status IN ('pending', 'queued', 'running')
                   AND created_at < ?4",
                params![
                    error,
                    format_ts(Utc::now()),
                    id.to_string(),
                    format_ts(created_before)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("force_fail_session: {e}")))?;

        if affected > 0 {
            self.changes.session_changed(id);
        }
        Ok(affected > 0)
    }

    async fn list_stuck_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, SessionError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE status = 'running'
               AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?1)
             ORDER BY created_at ASC"
        );
        Ok(self
            .query_sessions("list_stuck_sessions", &sql, params![now.timestamp_millis()])
            .await?)
    }

    async fn list_overdue_sessions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Session>, SessionError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE status IN ('pending', 'queued', 'running') AND created_at < ?1
             ORDER BY created_at ASC"
        );
        Ok(self
            .query_sessions(
                "list_overdue_sessions",
                &sql,
                params![format_ts(created_before)],
            )
            .await?)
    }
}

// ── EventLog ────────────────────────────────────────────────────────

#[async_trait]
impl EventLog for LibSqlBackend {
    async fn append_event(&self, session_id: Uuid, payload: &EventPayload) -> Result<Event, EventError> {
        self.insert_event(session_id, payload, None)
            .await?
            .ok_or(EventError::SessionNotFound { id: session_id })
    }

    async fn append_claimed(&self, claim: &Claim, payload: &EventPayload) -> Result<Event, EventError> {
        let inserted = self
            .insert_event(claim.session_id, payload, Some(claim.generation))
            .await?;

        match inserted {
            Some(event) => Ok(event),
            None if self.session_exists(claim.session_id).await? => Err(EventError::StaleClaim {
                id: claim.session_id,
                generation: claim.generation,
            }),
            None => Err(EventError::SessionNotFound {
                id: claim.session_id,
            }),
        }
    }

    async fn list_events(&self, session_id: Uuid) -> Result<Vec<Event>, EventError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE session_id = ?1
             ORDER BY created_at ASC, seq ASC"
        );
        self.query_events("list_events", &sql, params![session_id.to_string()])
            .await
    }

    async fn list_events_after(&self, session_id: Uuid, after_seq: i64) -> Result<Vec<Event>, EventError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE session_id = ?1 AND seq > ?2
             ORDER BY created_at ASC, seq ASC"
        );
        self.query_events(
            "list_events_after",
            &sql,
            params![session_id.to_string(), after_seq],
        )
        .await
    }
}

// ── ThreadStore ─────────────────────────────────────────────────────

#[async_trait]
impl ThreadStore for LibSqlBackend {
    async fn load_context(&self, thread_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role, content FROM conversation_messages
                 WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_context: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let role: String = row.get(0).unwrap_or_default();
            let content: String = row.get(1).unwrap_or_default();
            messages.push(ChatMessage::new(role, content));
        }
        Ok(messages)
    }

    async fn deliver_response(&self, thread_id: Uuid, content: &str) -> Result<(), DatabaseError> {
        self.add_thread_message(thread_id, "assistant", content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ErrorKind;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn new_session(db: &LibSqlBackend) -> Session {
        db.create_session(vec![ChatMessage::user("what is 6 x 7?")], Metadata::new())
            .await
            .unwrap()
    }

    /// Push the lease into the past so the session counts as abandoned.
    async fn expire_lease(db: &LibSqlBackend, id: Uuid) {
        db.conn()
            .execute(
                "UPDATE sessions SET lease_expires_at_ms = ?1 WHERE id = ?2",
                params![Utc::now().timestamp_millis() - 1, id.to_string()],
            )
            .await
            .unwrap();
    }

    // ── Session tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let db = test_db().await;
        let mut metadata = Metadata::new();
        metadata.insert("thread_id".into(), json!("t-1"));
        let created = db
            .create_session(vec![ChatMessage::user("hi")], metadata)
            .await
            .unwrap();

        let fetched = db.get_session(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Pending);
        assert_eq!(fetched.execution_count, 0);
        assert_eq!(fetched.messages, vec![ChatMessage::user("hi")]);
        assert_eq!(fetched.metadata["thread_id"], "t-1");
        assert!(fetched.started_at.is_none());
        assert!(fetched.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn get_missing_session_is_none() {
        let db = test_db().await;
        assert!(db.get_session(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_queued_only_from_pending() {
        let db = test_db().await;
        let session = new_session(&db).await;

        assert!(db.mark_queued(session.id).await.unwrap());
        assert!(!db.mark_queued(session.id).await.unwrap());
        let fetched = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Queued);

        let err = db.mark_queued(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn claim_sets_running_and_bumps_count() {
        let db = test_db().await;
        let session = new_session(&db).await;

        let claim = db.claim_session(session.id, LEASE).await.unwrap();
        assert_eq!(claim.generation, 1);

        let fetched = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Running);
        assert_eq!(fetched.execution_count, 1);
        assert!(fetched.started_at.is_some());
        assert!(fetched.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn second_claim_conflicts_while_lease_held() {
        let db = test_db().await;
        let session = new_session(&db).await;
        db.claim_session(session.id, LEASE).await.unwrap();

        let err = db.claim_session(session.id, LEASE).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ClaimConflict {
                status: SessionStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let db = Arc::new(test_db().await);
        let session = new_session(&db).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.claim_session(session.id, LEASE).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let fetched = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.execution_count, 1);
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let first = db.claim_session(session.id, LEASE).await.unwrap();
        expire_lease(&db, session.id).await;

        let second = db.claim_session(session.id, LEASE).await.unwrap();
        assert_eq!(second.generation, first.generation + 1);

        let err = db.finalize_session(&first, "stale").await.unwrap_err();
        assert!(matches!(err, SessionError::StaleFinalize { generation: 1, .. }));

        let done = db.finalize_session(&second, "42").await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.execution_count, 2);
        assert_eq!(done.final_response.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn terminal_sessions_cannot_be_claimed() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let claim = db.claim_session(session.id, LEASE).await.unwrap();
        db.finalize_session(&claim, "done").await.unwrap();

        let err = db.claim_session(session.id, LEASE).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ClaimConflict {
                status: SessionStatus::Completed,
                ..
            }
        ));
        let fetched = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.execution_count, 1);
    }

    #[tokio::test]
    async fn claim_missing_session_is_not_found() {
        let db = test_db().await;
        let err = db.claim_session(Uuid::new_v4(), LEASE).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn finalize_twice_is_stale() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let claim = db.claim_session(session.id, LEASE).await.unwrap();

        db.finalize_session(&claim, "first").await.unwrap();
        let err = db.finalize_session(&claim, "second").await.unwrap_err();
        assert!(matches!(err, SessionError::StaleFinalize { .. }));

        let fetched = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.final_response.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn fail_records_error_only() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let claim = db.claim_session(session.id, LEASE).await.unwrap();

        let failed = db.fail_session(&claim, "tool exploded").await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("tool exploded"));
        assert!(failed.final_response.is_none());
        assert!(failed.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn renew_lease_requires_current_generation() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let first = db.claim_session(session.id, Duration::from_millis(1)).await.unwrap();

        let renewed = db.renew_lease(&first, LEASE).await.unwrap();
        assert!(renewed.lease_expires_at > first.lease_expires_at);

        expire_lease(&db, session.id).await;
        db.claim_session(session.id, LEASE).await.unwrap();
        let err = db.renew_lease(&first, LEASE).await.unwrap_err();
        assert!(matches!(err, SessionError::StaleClaim { generation: 1, .. }));
    }

    #[tokio::test]
    async fn force_fail_respects_age_and_terminal_state() {
        let db = test_db().await;
        let session = new_session(&db).await;

        // Not old enough yet.
        let cutoff_past = session.created_at - chrono::Duration::seconds(1);
        assert!(!db.force_fail_session(session.id, "too old", cutoff_past).await.unwrap());

        let cutoff_future = Utc::now() + chrono::Duration::seconds(1);
        assert!(db.force_fail_session(session.id, "too old", cutoff_future).await.unwrap());
        let fetched = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("too old"));

        // Already terminal.
        assert!(!db.force_fail_session(session.id, "again", cutoff_future).await.unwrap());
    }

    #[tokio::test]
    async fn stuck_and_overdue_listings() {
        let db = test_db().await;
        let running = new_session(&db).await;
        let pending = new_session(&db).await;
        db.claim_session(running.id, LEASE).await.unwrap();

        assert!(db.list_stuck_sessions(Utc::now()).await.unwrap().is_empty());
        expire_lease(&db, running.id).await;
        let stuck = db.list_stuck_sessions(Utc::now()).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, running.id);

        let overdue = db
            .list_overdue_sessions(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let ids: Vec<Uuid> = overdue.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![running.id, pending.id]);
    }

    // ── Event tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn events_list_in_append_order() {
        let db = test_db().await;
        let session = new_session(&db).await;

        for i in 0..5 {
            db.append_event(session.id, &EventPayload::thinking(format!("step {i}")))
                .await
                .unwrap();
        }

        let events = db.list_events(session.id).await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.event_data["content"], format!("step {i}"));
        }
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

        // Stable across reads.
        assert_eq!(db.list_events(session.id).await.unwrap(), events);
    }

    #[tokio::test]
    async fn append_to_missing_session_fails() {
        let db = test_db().await;
        let err = db
            .append_event(Uuid::new_v4(), &EventPayload::thinking("orphan"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn append_claimed_rejects_superseded_claim() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let first = db.claim_session(session.id, LEASE).await.unwrap();
        db.append_claimed(&first, &EventPayload::tool_call("calc", json!({"expr": "6*7"})))
            .await
            .unwrap();

        expire_lease(&db, session.id).await;
        let second = db.claim_session(session.id, LEASE).await.unwrap();

        let err = db
            .append_claimed(&first, &EventPayload::thinking("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::StaleClaim { generation: 1, .. }));

        db.append_claimed(&second, &EventPayload::thinking("live"))
            .await
            .unwrap();
        let events = db.list_events(session.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_data["content"], "live");
    }

    #[tokio::test]
    async fn list_events_after_cursor() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let first = db
            .append_event(session.id, &EventPayload::thinking("a"))
            .await
            .unwrap();
        db.append_event(
            session.id,
            &EventPayload::error("boom", ErrorKind::Fatal, None, true),
        )
        .await
        .unwrap();

        let after = db.list_events_after(session.id, first.seq).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].event_type, EventType::Error);
        assert!(db.list_events_after(session.id, after[0].seq).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn appends_publish_changes() {
        let db = test_db().await;
        let session = new_session(&db).await;
        let mut rx = db.changes().subscribe();

        let event = db
            .append_event(session.id, &EventPayload::thinking("x"))
            .await
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.session_id, session.id);
        assert_eq!(
            change.kind,
            crate::notify::ChangeKind::Event { seq: event.seq }
        );
    }

    // ── Thread tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn thread_context_and_delivery() {
        let db = test_db().await;
        let thread = Uuid::new_v4();
        db.add_thread_message(thread, "user", "hello").await.unwrap();
        db.add_thread_message(thread, "assistant", "hi").await.unwrap();
        db.add_thread_message(thread, "user", "what is 6 x 7?").await.unwrap();

        let context = db.load_context(thread).await.unwrap();
        assert_eq!(context.len(), 3);
        assert_eq!(context[2], ChatMessage::user("what is 6 x 7?"));

        db.deliver_response(thread, "42").await.unwrap();
        let context = db.load_context(thread).await.unwrap();
        assert_eq!(context.last(), Some(&ChatMessage::assistant("42")));
    }

    #[tokio::test]
    async fn empty_thread_has_no_context() {
        let db = test_db().await;
        assert!(db.load_context(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
