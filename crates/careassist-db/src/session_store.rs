use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use careassist_common::{
    ChatContext, ChatSession, ContextKind, Error, MessageMeta, NewMessage, Result, SessionStatus,
    StoredMessage,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cursor::Cursor;

pub const MAX_PAGE_SIZE: usize = 100;

const SESSION_COLUMNS: &str = "id, user_id, subject_id, context_kind, context_id, context_data,
     title, status, message_count, last_message_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, meta, created_at";

/// One page of a session's message log. Pages walk backwards from the newest
/// message; items inside a page are in chronological order.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub items: Vec<StoredMessage>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
    pub total: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub subject_id: Option<String>,
    pub context_kind: Option<ContextKind>,
    pub status: Option<SessionStatus>,
}

/// Persistent storage for chat sessions and their append-only message log.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening conversation store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    subject_id TEXT NOT NULL,
                    context_kind TEXT NOT NULL,
                    context_id TEXT,
                    context_data TEXT NOT NULL DEFAULT '{}',
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    message_count INTEGER NOT NULL DEFAULT 0,
                    last_message_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_owner
                    ON sessions(user_id, subject_id, context_kind, status);

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    meta TEXT,
                    failed INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_session
                    ON messages(session_id, created_at, id);",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("conversation store lock poisoned".to_string()))
    }

    /// Return the most recent active session for this user, subject and
    /// context, or create one.
    pub fn create_or_resume_session(
        &self,
        user_id: &str,
        subject_id: &str,
        context: &ChatContext,
        title: Option<&str>,
    ) -> Result<(ChatSession, bool)> {
        let conn = self.lock()?;
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE user_id = ?1 AND subject_id = ?2 AND context_kind = ?3
                       AND context_id IS ?4 AND status = 'active'
                     ORDER BY updated_at DESC
                     LIMIT 1"
                ),
                params![
                    user_id,
                    subject_id,
                    context.kind.as_str(),
                    context.context_id
                ],
                SessionRow::from_row,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to look up session: {e}")))?;

        if let Some(row) = existing {
            let mut session = row.into_session()?;
            if !context.data.is_empty() && context.data != session.context.data {
                let data = serde_json::Value::Object(context.data.clone()).to_string();
                conn.execute(
                    "UPDATE sessions SET context_data = ?1 WHERE id = ?2",
                    params![data, session.id],
                )
                .map_err(|e| Error::Database(format!("failed to refresh session context: {e}")))?;
                session.context.data = context.data.clone();
            }
            debug!("resumed session {}", session.id);
            return Ok((session, true));
        }

        let now = now_micros();
        let id = uuid::Uuid::new_v4().to_string();
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| context.kind.default_title())
            .to_string();
        let data = serde_json::Value::Object(context.data.clone()).to_string();
        conn.execute(
            "INSERT INTO sessions
                (id, user_id, subject_id, context_kind, context_id, context_data, title,
                 status, message_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', 0, ?8, ?8)",
            params![
                id,
                user_id,
                subject_id,
                context.kind.as_str(),
                context.context_id,
                data,
                title,
                now
            ],
        )
        .map_err(|e| Error::Database(format!("failed to create session: {e}")))?;

        info!("created session {id} ({})", context.kind);
        let created_at = from_micros(now);
        Ok((
            ChatSession {
                id,
                user_id: user_id.to_string(),
                subject_id: subject_id.to_string(),
                context: context.clone(),
                title,
                status: SessionStatus::Active,
                message_count: 0,
                last_message_at: None,
                created_at,
                updated_at: created_at,
            },
            false,
        ))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let conn = self.lock()?;
        load_session(&conn, session_id)
    }

    /// Append messages in one transaction, keeping `message_count` in step.
    pub fn append_messages(
        &self,
        session_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<StoredMessage>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        ensure_session_exists(&tx, session_id)?;

        let mut stored = Vec::with_capacity(messages.len());
        let mut last = latest_message_micros(&tx, session_id)?;
        for message in messages {
            let created = next_micros(last);
            stored.push(insert_message(&tx, session_id, message, created)?);
            last = Some(created);
        }

        let count = stored.len() as i64;
        tx.execute(
            "UPDATE sessions
             SET message_count = message_count + ?1, last_message_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![count, last, session_id],
        )
        .map_err(|e| Error::Database(format!("failed to update session counters: {e}")))?;

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit messages: {e}")))?;
        Ok(stored)
    }

    /// Page backwards through a session's messages. `limit` is clamped to
    /// `1..=MAX_PAGE_SIZE`.
    pub fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<MessagePage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let position = match cursor {
            Some(cursor) => Some(
                cursor
                    .decode()
                    .ok_or_else(|| Error::Validation("invalid cursor".to_string()))?,
            ),
            None => None,
        };
        let (before_micros, before_id) = match position {
            Some((micros, id)) => (Some(micros), Some(id)),
            None => (None, None),
        };

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1
                   AND (?2 IS NULL OR created_at < ?2 OR (created_at = ?2 AND id < ?3))
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?4"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;
        let rows = stmt
            .query_map(
                params![session_id, before_micros, before_id, (limit + 1) as i64],
                MessageRow::from_row,
            )
            .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?;
        let mut items = collect_messages(rows)?;

        let has_more = items.len() > limit;
        items.truncate(limit);
        items.reverse();
        let next_cursor = if has_more {
            items.first().map(|m| Cursor::new(m.created_at, &m.id))
        } else {
            None
        };

        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count messages: {e}")))?;

        Ok(MessagePage {
            items,
            next_cursor,
            has_more,
            total: total as u64,
        })
    }

    /// Chronological tail of the log for prompting. Failed assistant
    /// placeholders are skipped.
    pub fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1 AND failed = 0
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], MessageRow::from_row)
            .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?;
        let mut messages = collect_messages(rows)?;
        messages.reverse();
        Ok(messages)
    }

    /// The most recent user message and the assistant reply that follows it,
    /// if any.
    pub fn last_turn(
        &self,
        session_id: &str,
    ) -> Result<Option<(StoredMessage, Option<StoredMessage>)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 2"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;
        let rows = stmt
            .query_map(params![session_id], MessageRow::from_row)
            .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?;
        let mut latest = collect_messages(rows)?.into_iter();

        use careassist_common::MessageRole::{Assistant, User};
        let turn = match (latest.next(), latest.next()) {
            (Some(last), _) if last.role == User => Some((last, None)),
            (Some(last), Some(prev)) if last.role == Assistant && prev.role == User => {
                Some((prev, Some(last)))
            }
            _ => None,
        };
        Ok(turn)
    }

    /// Swap a failed assistant placeholder for a fresh reply in one
    /// transaction. The message count is unchanged.
    pub fn replace_failed_reply(
        &self,
        session_id: &str,
        failed_id: &str,
        reply: &NewMessage,
    ) -> Result<StoredMessage> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        let removed = tx
            .execute(
                "DELETE FROM messages WHERE id = ?1 AND session_id = ?2 AND failed = 1",
                params![failed_id, session_id],
            )
            .map_err(|e| Error::Database(format!("failed to remove failed reply: {e}")))?;
        if removed == 0 {
            return Err(Error::Validation(format!(
                "message {failed_id} is not a failed reply in this session"
            )));
        }

        let created = next_micros(latest_message_micros(&tx, session_id)?);
        let stored = insert_message(&tx, session_id, reply, created)?;
        tx.execute(
            "UPDATE sessions SET last_message_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![created, session_id],
        )
        .map_err(|e| Error::Database(format!("failed to update session: {e}")))?;

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit reply: {e}")))?;
        Ok(stored)
    }

    /// Sessions owned by `user_id`, most recently active first.
    pub fn list_sessions(&self, user_id: &str, filter: &SessionFilter) -> Result<Vec<ChatSession>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR subject_id = ?2)
                   AND (?3 IS NULL OR context_kind = ?3)
                   AND (?4 IS NULL OR status = ?4)
                 ORDER BY updated_at DESC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare session query: {e}")))?;
        let rows = stmt
            .query_map(
                params![
                    user_id,
                    filter.subject_id,
                    filter.context_kind.map(|k| k.as_str()),
                    filter.status.map(|s| s.as_str()),
                ],
                SessionRow::from_row,
            )
            .map_err(|e| Error::Database(format!("failed to list sessions: {e}")))?;

        let mut sessions = Vec::new();
        for row in rows {
            let row =
                row.map_err(|e| Error::Database(format!("failed to read session row: {e}")))?;
            sessions.push(row.into_session()?);
        }
        Ok(sessions)
    }

    pub fn update_session_title(&self, session_id: &str, title: &str) -> Result<ChatSession> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, now_micros(), session_id],
            )
            .map_err(|e| Error::Database(format!("failed to rename session: {e}")))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("session {session_id}")));
        }
        load_session(&conn, session_id)?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Archive an active session. Archiving twice is a no-op.
    pub fn archive_session(&self, session_id: &str) -> Result<ChatSession> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET status = 'archived', updated_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![now_micros(), session_id],
            )
            .map_err(|e| Error::Database(format!("failed to archive session: {e}")))?;
        if changed > 0 {
            info!("archived session {session_id}");
        }
        load_session(&conn, session_id)?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Delete a session and its messages. Returns whether a row was removed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(|e| Error::Database(format!("failed to delete messages: {e}")))?;
        let removed = tx
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
            .map_err(|e| Error::Database(format!("failed to delete session: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit delete: {e}")))?;
        if removed > 0 {
            info!("deleted session {session_id}");
        }
        Ok(removed > 0)
    }
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<ChatSession>> {
    let row = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![session_id],
            SessionRow::from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load session: {e}")))?;
    row.map(SessionRow::into_session).transpose()
}

fn ensure_session_exists(tx: &Transaction<'_>, session_id: &str) -> Result<()> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM sessions WHERE id = ?1",
            params![session_id],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load session: {e}")))?;
    exists.ok_or_else(|| Error::NotFound(format!("session {session_id}")))
}

fn latest_message_micros(tx: &Transaction<'_>, session_id: &str) -> Result<Option<i64>> {
    tx.query_row(
        "SELECT MAX(created_at) FROM messages WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to read latest message time: {e}")))
}

fn insert_message(
    tx: &Transaction<'_>,
    session_id: &str,
    message: &NewMessage,
    created_micros: i64,
) -> Result<StoredMessage> {
    let id = uuid::Uuid::new_v4().to_string();
    let meta = message
        .meta
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let failed = message.meta.as_ref().is_some_and(MessageMeta::is_failure);
    tx.execute(
        "INSERT INTO messages (id, session_id, role, content, meta, failed, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            session_id,
            message.role.as_str(),
            message.content,
            meta,
            failed,
            created_micros
        ],
    )
    .map_err(|e| Error::Database(format!("failed to append message: {e}")))?;

    Ok(StoredMessage {
        id,
        session_id: session_id.to_string(),
        role: message.role,
        content: message.content.clone(),
        meta: message.meta.clone(),
        created_at: from_micros(created_micros),
    })
}

fn collect_messages(
    rows: impl Iterator<Item = rusqlite::Result<MessageRow>>,
) -> Result<Vec<StoredMessage>> {
    let mut messages = Vec::new();
    for row in rows {
        let row = row.map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
        messages.push(row.into_message()?);
    }
    Ok(messages)
}

struct SessionRow {
    id: String,
    user_id: String,
    subject_id: String,
    context_kind: String,
    context_id: Option<String>,
    context_data: String,
    title: String,
    status: String,
    message_count: i64,
    last_message_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            subject_id: row.get(2)?,
            context_kind: row.get(3)?,
            context_id: row.get(4)?,
            context_data: row.get(5)?,
            title: row.get(6)?,
            status: row.get(7)?,
            message_count: row.get(8)?,
            last_message_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_session(self) -> Result<ChatSession> {
        let data = match serde_json::from_str(&self.context_data) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("session {} has malformed context data, ignoring it", self.id);
                serde_json::Map::new()
            }
        };
        Ok(ChatSession {
            context: ChatContext {
                kind: self.context_kind.parse()?,
                context_id: self.context_id,
                data,
            },
            status: self.status.parse()?,
            message_count: self.message_count.max(0) as u64,
            last_message_at: self.last_message_at.map(from_micros),
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
            id: self.id,
            user_id: self.user_id,
            subject_id: self.subject_id,
            title: self.title,
        })
    }
}

struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    meta: Option<String>,
    created_at: i64,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            meta: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_message(self) -> Result<StoredMessage> {
        let meta = self.meta.and_then(|raw| {
            serde_json::from_str::<MessageMeta>(&raw)
                .map_err(|e| warn!("message {} has unreadable meta: {e}", self.id))
                .ok()
        });
        Ok(StoredMessage {
            role: self.role.parse()?,
            created_at: from_micros(self.created_at),
            id: self.id,
            session_id: self.session_id,
            content: self.content,
            meta,
        })
    }
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Next creation time for a session, strictly after its latest message.
fn next_micros(last: Option<i64>) -> i64 {
    let now = now_micros();
    match last {
        Some(last) if last >= now => last + 1,
        _ => now,
    }
}

fn from_micros(value: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(value).unwrap_or_else(|| {
        warn!("invalid stored timestamp {value}, falling back to now");
        Utc::now()
    })
}
