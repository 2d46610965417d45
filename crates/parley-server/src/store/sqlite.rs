//! SQLite-backed [`ChatStore`].

use super::{ChatStore, NewUser, StoreError, StoreResult, StoredMessage};
use chrono::{DateTime, SecondsFormat, Utc};
use parley_core::messages::{Direction, HistoryEntry};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT,
    password TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL,
    recipient_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (sender_id) REFERENCES users(id),
    FOREIGN KEY (recipient_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_id, recipient_id, timestamp);
";

/// rusqlite is synchronous; one connection behind a mutex serializes access.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating its parent directory and
    /// the schema if needed.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "database ready");
        Ok(store)
    }

    /// Private in-memory database, used by tests and throwaway servers.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("database mutex poisoned".into()))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
                StoreError::ConstraintViolation(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// Fixed-width UTC timestamps so lexical order equals time order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl ChatStore for SqliteStore {
    fn insert_user(&self, user: &NewUser) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (username, email, password) VALUES (?1, ?2, ?3)",
            params![user.username, user.email, user.password_hash],
        )?;
        Ok(())
    }

    fn user_exists(&self, username: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
            params![username],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn password_hash(&self, username: &str) -> StoreResult<String> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT password FROM users WHERE username = ?1",
            params![username],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
    }

    fn insert_message(&self, message: &StoredMessage) -> StoreResult<()> {
        let conn = self.lock()?;
        // Resolve both user ids in the same statement so the insert is atomic.
        let inserted = conn.execute(
            "INSERT INTO messages (sender_id, recipient_id, content, timestamp)
             SELECT s.id, r.id, ?3, ?4 FROM users s, users r
             WHERE s.username = ?1 AND r.username = ?2",
            params![
                message.sender,
                message.recipient,
                message.content,
                format_ts(&message.created_at)
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::NotFound(format!(
                "sender {} or recipient {}",
                message.sender, message.recipient
            )));
        }
        Ok(())
    }

    fn conversation(&self, viewer: &str, other: &str) -> StoreResult<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.username = ?1, m.content, m.timestamp
             FROM messages m
             JOIN users s ON s.id = m.sender_id
             JOIN users r ON r.id = m.recipient_id
             WHERE (s.username = ?1 AND r.username = ?2)
                OR (s.username = ?2 AND r.username = ?1)
             ORDER BY m.timestamp ASC, m.id ASC",
        )?;
        let rows = stmt.query_map(params![viewer, other], |row| {
            let sent: bool = row.get(0)?;
            let raw_ts: String = row.get(2)?;
            Ok(HistoryEntry {
                direction: if sent {
                    Direction::Sent
                } else {
                    Direction::Received
                },
                content: row.get(1)?,
                timestamp: parse_ts(2, &raw_ts)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn conversation_partners(&self, username: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT u.username
             FROM users me
             JOIN messages m ON m.sender_id = me.id OR m.recipient_id = me.id
             JOIN users u ON u.id = CASE WHEN m.sender_id = me.id
                                         THEN m.recipient_id ELSE m.sender_id END
             WHERE me.username = ?1
             ORDER BY u.username",
        )?;
        let rows = stmt.query_map(params![username], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
