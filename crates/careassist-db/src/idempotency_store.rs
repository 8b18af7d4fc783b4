use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use careassist_common::{Error, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(300);

/// Response recorded for a completed idempotent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: String,
}

/// Result of trying to claim an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This delivery owns the key and must run the handler.
    Claimed,
    /// A previous delivery completed; replay its response.
    Replay(StoredResponse),
    /// Another delivery holds the key and has not finished.
    InFlight,
    /// The key was used by another user or on another endpoint.
    Mismatch(String),
}

/// Storage seam for idempotency records. Implementations must make `claim`
/// atomic: at most one concurrent caller observes `Claimed` for a key.
pub trait IdempotencyRecords: Send + Sync {
    fn claim(&self, key: &str, user_id: &str, path: &str, request: &str)
    -> Result<ClaimOutcome>;

    fn complete(&self, key: &str, status: u16, body: &str) -> Result<()>;

    /// Drop a pending claim so the client may retry with the same key.
    fn release(&self, key: &str) -> Result<()>;

    /// Delete records older than `retention`. Returns the number removed.
    fn purge_expired(&self, retention: Duration) -> Result<usize>;
}

/// SQLite-backed idempotency records.
pub struct IdempotencyStore {
    conn: Mutex<Connection>,
    pending_ttl: Duration,
}

impl IdempotencyStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening idempotency store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                path TEXT NOT NULL,
                request TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                status_code INTEGER,
                response TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_idempotency_created
                ON idempotency_keys(created_at);",
        )
        .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            pending_ttl: DEFAULT_PENDING_TTL,
        })
    }

    /// Age after which a pending claim is considered abandoned.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("idempotency store lock poisoned".to_string()))
    }
}

struct RecordRow {
    user_id: String,
    path: String,
    request: String,
    state: String,
    status_code: Option<i64>,
    response: Option<String>,
    created_at: i64,
}

impl IdempotencyRecords for IdempotencyStore {
    fn claim(
        &self,
        key: &str,
        user_id: &str,
        path: &str,
        request: &str,
    ) -> Result<ClaimOutcome> {
        let conn = self.lock()?;
        let now = Utc::now().timestamp_micros();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO idempotency_keys (key, user_id, path, request, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key, user_id, path, request, now],
            )
            .map_err(|e| Error::Database(format!("failed to claim idempotency key: {e}")))?;
        if inserted == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let record = conn
            .query_row(
                "SELECT user_id, path, request, state, status_code, response, created_at
                 FROM idempotency_keys WHERE key = ?1",
                params![key],
                |row| {
                    Ok(RecordRow {
                        user_id: row.get(0)?,
                        path: row.get(1)?,
                        request: row.get(2)?,
                        state: row.get(3)?,
                        status_code: row.get(4)?,
                        response: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load idempotency key: {e}")))?;

        // Removed by another process between the insert and the read.
        let Some(record) = record else {
            return Ok(ClaimOutcome::InFlight);
        };

        if record.user_id != user_id {
            return Ok(ClaimOutcome::Mismatch(
                "idempotency key belongs to another user".to_string(),
            ));
        }
        if record.path != path {
            return Ok(ClaimOutcome::Mismatch(
                "idempotency key was already used on another endpoint".to_string(),
            ));
        }
        // The key alone identifies the logical attempt; a changed body still replays.
        if record.request != request {
            debug!("idempotency key {key} reused with a different request body");
        }

        if record.state == "completed" {
            let status = record
                .status_code
                .and_then(|s| u16::try_from(s).ok())
                .ok_or_else(|| {
                    Error::Database(format!("completed idempotency key {key} has no status"))
                })?;
            return Ok(ClaimOutcome::Replay(StoredResponse {
                status,
                body: record.response.unwrap_or_default(),
            }));
        }

        let ttl = self.pending_ttl.as_micros() as i64;
        if now - record.created_at > ttl {
            let taken = conn
                .execute(
                    "UPDATE idempotency_keys SET created_at = ?1
                     WHERE key = ?2 AND state = 'pending' AND created_at = ?3",
                    params![now, key, record.created_at],
                )
                .map_err(|e| Error::Database(format!("failed to reclaim idempotency key: {e}")))?;
            if taken == 1 {
                warn!("reclaimed stale idempotency key {key}");
                return Ok(ClaimOutcome::Claimed);
            }
        }
        Ok(ClaimOutcome::InFlight)
    }

    fn complete(&self, key: &str, status: u16, body: &str) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE idempotency_keys
                 SET state = 'completed', status_code = ?1, response = ?2, completed_at = ?3
                 WHERE key = ?4 AND state = 'pending'",
                params![status, body, Utc::now().timestamp_micros(), key],
            )
            .map_err(|e| Error::Database(format!("failed to complete idempotency key: {e}")))?;
        if updated == 0 {
            warn!("idempotency key {key} was not pending at completion");
        }
        Ok(())
    }

    fn release(&self, key: &str) -> Result<()> {
        self.lock()?
            .execute(
                "DELETE FROM idempotency_keys WHERE key = ?1 AND state = 'pending'",
                params![key],
            )
            .map_err(|e| Error::Database(format!("failed to release idempotency key: {e}")))?;
        Ok(())
    }

    fn purge_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp_micros() - retention.as_micros() as i64;
        let removed = self
            .lock()?
            .execute(
                "DELETE FROM idempotency_keys WHERE created_at < ?1",
                params![cutoff],
            )
            .map_err(|e| Error::Database(format!("failed to purge idempotency keys: {e}")))?;
        if removed > 0 {
            info!("purged {removed} expired idempotency records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdempotencyStore {
        IdempotencyStore::in_memory().expect("in-memory store should open")
    }

    #[test]
    fn first_claim_wins_then_in_flight() {
        let store = store();
        assert_eq!(
            store.claim("k1", "u1", "/api/chat/start", "{}").unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim("k1", "u1", "/api/chat/start", "{}").unwrap(),
            ClaimOutcome::InFlight
        );
    }

    #[test]
    fn completed_key_replays_response() {
        let store = store();
        store.claim("k1", "u1", "/p", "{}").unwrap();
        store.complete("k1", 200, r#"{"ok":true}"#).unwrap();
        assert_eq!(
            store.claim("k1", "u1", "/p", "{}").unwrap(),
            ClaimOutcome::Replay(StoredResponse {
                status: 200,
                body: r#"{"ok":true}"#.to_string()
            })
        );
    }

    #[test]
    fn released_key_can_be_claimed_again() {
        let store = store();
        store.claim("k1", "u1", "/p", "{}").unwrap();
        store.release("k1").unwrap();
        assert_eq!(
            store.claim("k1", "u1", "/p", "{}").unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[test]
    fn release_does_not_drop_completed_record() {
        let store = store();
        store.claim("k1", "u1", "/p", "{}").unwrap();
        store.complete("k1", 201, "{}").unwrap();
        store.release("k1").unwrap();
        assert!(matches!(
            store.claim("k1", "u1", "/p", "{}").unwrap(),
            ClaimOutcome::Replay(_)
        ));
    }

    #[test]
    fn other_user_or_endpoint_is_mismatch() {
        let store = store();
        store.claim("k1", "u1", "/p", r#"{"text":"a"}"#).unwrap();
        assert!(matches!(
            store.claim("k1", "u2", "/p", r#"{"text":"a"}"#).unwrap(),
            ClaimOutcome::Mismatch(_)
        ));
        assert!(matches!(
            store.claim("k1", "u1", "/q", r#"{"text":"a"}"#).unwrap(),
            ClaimOutcome::Mismatch(_)
        ));
    }

    #[test]
    fn changed_body_replays_original_response() {
        let store = store();
        store.claim("k1", "u1", "/p", r#"{"text":"a"}"#).unwrap();
        store.complete("k1", 200, r#"{"answer":"first"}"#).unwrap();
        assert_eq!(
            store.claim("k1", "u1", "/p", r#"{"text":"b"}"#).unwrap(),
            ClaimOutcome::Replay(StoredResponse {
                status: 200,
                body: r#"{"answer":"first"}"#.to_string()
            })
        );
    }

    #[test]
    fn stale_pending_claim_is_reclaimed() {
        let store = store().with_pending_ttl(Duration::ZERO);
        store.claim("k1", "u1", "/p", "{}").unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            store.claim("k1", "u1", "/p", "{}").unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[test]
    fn purge_removes_old_records_only() {
        let store = store();
        store.claim("old", "u1", "/p", "{}").unwrap();
        store.complete("old", 200, "{}").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        store.claim("new", "u1", "/p", "{}").unwrap();

        assert_eq!(store.purge_expired(Duration::from_millis(100)).unwrap(), 1);
        assert_eq!(store.purge_expired(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(
            store.claim("old", "u1", "/p", "{}").unwrap(),
            ClaimOutcome::Claimed
        );
    }
}
