//! Session registry: who is connected on which connection.
//!
//! Two maps, connection → session and username → connection, kept as exact
//! inverses of each other. Every read and write goes through one mutex and
//! every mutation updates both maps inside the same critical section. The
//! lock is never held across socket I/O; callers get cloned handles back and
//! write after the guard is dropped.

use super::connection::{ConnId, ConnectionHandle};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A live association between a connection and an authenticated identity.
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub handle: ConnectionHandle,
}

/// Outcome of [`SessionRegistry::register`].
#[derive(Debug, Default)]
pub struct Registration {
    /// Another connection that was registered under the same username and
    /// has been evicted. Closing it is up to the caller.
    pub displaced: Option<ConnectionHandle>,
    /// The username this connection was registered under before, if it
    /// switched identity.
    pub previous_username: Option<String>,
}

#[derive(Default)]
struct Maps {
    by_conn: HashMap<ConnId, Session>,
    by_user: HashMap<String, ConnId>,
}

/// Registry of authenticated connections.
#[derive(Default)]
pub struct SessionRegistry {
    maps: Mutex<Maps>,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as `username`.
    ///
    /// Overwrites any existing entry for the username and drops any identity
    /// the connection held before.
    pub async fn register(&self, handle: ConnectionHandle, username: String) -> Registration {
        let conn = handle.id();
        let mut maps = self.maps.lock().await;
        let mut outcome = Registration::default();

        if let Some(prev) = maps.by_conn.remove(&conn) {
            if maps.by_user.get(&prev.username) == Some(&conn) {
                maps.by_user.remove(&prev.username);
            }
            if prev.username != username {
                outcome.previous_username = Some(prev.username);
            }
        }

        if let Some(other) = maps.by_user.insert(username.clone(), conn) {
            if other != conn {
                outcome.displaced = maps.by_conn.remove(&other).map(|s| s.handle);
            }
        }

        maps.by_conn.insert(
            conn,
            Session {
                username: username.clone(),
                handle,
            },
        );
        drop(maps);

        info!(
            conn_id = %conn,
            username = %username,
            displaced = ?outcome.displaced.as_ref().map(|h| h.id().get()),
            "session registered"
        );
        outcome
    }

    /// Remove a connection from both maps. Idempotent.
    ///
    /// Returns the username it was registered under, if any.
    pub async fn unregister(&self, conn: ConnId) -> Option<String> {
        let mut maps = self.maps.lock().await;
        let session = maps.by_conn.remove(&conn)?;
        if maps.by_user.get(&session.username) == Some(&conn) {
            maps.by_user.remove(&session.username);
        }
        drop(maps);
        debug!(conn_id = %conn, username = %session.username, "session unregistered");
        Some(session.username)
    }

    /// Live connection registered under `username`.
    pub async fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
        let maps = self.maps.lock().await;
        maps.by_user
            .get(username)
            .and_then(|c| maps.by_conn.get(c))
            .map(|s| s.handle.clone())
    }

    /// Username a connection is registered under.
    pub async fn identity_of(&self, conn: ConnId) -> Option<String> {
        let maps = self.maps.lock().await;
        maps.by_conn.get(&conn).map(|s| s.username.clone())
    }

    /// Online flag for each requested username, taken under one lock.
    pub async fn presence(&self, usernames: &[String]) -> BTreeMap<String, bool> {
        let maps = self.maps.lock().await;
        usernames
            .iter()
            .map(|u| (u.clone(), maps.by_user.contains_key(u)))
            .collect()
    }

    /// Empty the registry, returning every handle that was registered.
    pub async fn drain(&self) -> Vec<ConnectionHandle> {
        let mut maps = self.maps.lock().await;
        maps.by_user.clear();
        maps.by_conn.drain().map(|(_, s)| s.handle).collect()
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.maps.lock().await.by_conn.len()
    }
}
