//! Persistence gateway: users and messages.
//!
//! The core only talks to storage through [`ChatStore`]; the SQLite
//! implementation lives in [`sqlite`]. Calls are synchronous and are expected
//! to be driven from `spawn_blocking` by async callers.

pub mod sqlite;

use chrono::{DateTime, Utc};
use parley_core::messages::{ChatMessage, HistoryEntry};
use parley_core::ParleyError;
use std::sync::Arc;
use thiserror::Error;

pub use sqlite::SqliteStore;

/// Error kinds the core distinguishes when talking to storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness or foreign-key constraint rejected the write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<StoreError> for ParleyError {
    fn from(e: StoreError) -> Self {
        ParleyError::Storage(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A user row as written by registration. The password is already hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&ChatMessage> for StoredMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            sender: m.send.clone(),
            recipient: m.recv.clone(),
            content: m.msg.clone(),
            created_at: m.created_at,
        }
    }
}

/// Operations the relay core needs from durable storage.
///
/// Each call is atomic on its own; implementations serialize their own
/// internal access.
pub trait ChatStore: Send + Sync + 'static {
    /// Insert a new user. A taken username is `ConstraintViolation`.
    fn insert_user(&self, user: &NewUser) -> StoreResult<()>;

    fn user_exists(&self, username: &str) -> StoreResult<bool>;

    /// Stored password hash. `NotFound` if the user does not exist.
    fn password_hash(&self, username: &str) -> StoreResult<String>;

    fn insert_message(&self, message: &StoredMessage) -> StoreResult<()>;

    /// Conversation between `viewer` and `other`, ascending by timestamp,
    /// with directions relative to `viewer`.
    fn conversation(&self, viewer: &str, other: &str) -> StoreResult<Vec<HistoryEntry>>;

    /// Existence check used by `find_user`.
    fn resolve_username(&self, username: &str) -> StoreResult<bool> {
        self.user_exists(username)
    }

    /// Usernames `username` has exchanged at least one message with, sorted.
    fn conversation_partners(&self, username: &str) -> StoreResult<Vec<String>>;
}

/// Shared handle to the store used across connection tasks.
pub type SharedStore = Arc<dyn ChatStore>;

/// Run a store call on the blocking pool.
pub async fn with_store<T, F>(store: &SharedStore, f: F) -> StoreResult<T>
where
    F: FnOnce(&dyn ChatStore) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
}
