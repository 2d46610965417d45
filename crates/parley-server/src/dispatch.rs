//! Protocol dispatcher: one per connection.
//!
//! Tracks whether the connection has authenticated and routes each decoded
//! envelope to its handler. Handlers resolve business errors (bad password,
//! taken username, unknown user) into typed `error` replies; any `Err`
//! returned from [`Dispatcher::dispatch`] is fatal and closes the connection.

use crate::auth::{hash_password, verify_password};
use crate::session::ConnectionHandle;
use crate::state::RelayState;
use crate::store::{with_store, NewUser, StoreError};
use parley_core::codec::{decode_payload, decode_wrapped};
use parley_core::messages::{ChatMessage, Credentials, HistoryQuery, PresenceQuery, TextPayload};
use parley_core::{Envelope, ErrorReason, MsgKind, ParleyError, ParleyResult};
use tracing::{debug, info, warn};

/// Per-connection protocol state. Closing is the end of the dispatcher itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { username: String },
}

/// Handles the envelopes of a single connection, strictly in arrival order.
pub struct Dispatcher {
    handle: ConnectionHandle,
    state: SessionState,
    relay: RelayState,
}

impl Dispatcher {
    pub fn new(handle: ConnectionHandle, relay: RelayState) -> Self {
        Self {
            handle,
            state: SessionState::Unauthenticated,
            relay,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Authenticated username, if any.
    pub fn username(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { username } => Some(username),
            SessionState::Unauthenticated => None,
        }
    }

    /// Handle one envelope, returning the reply to write back (if any).
    pub async fn dispatch(&mut self, envelope: Envelope) -> ParleyResult<Option<Envelope>> {
        if let MsgKind::Unknown(kind) = &envelope.kind {
            warn!(conn_id = %self.handle.id(), kind = %kind, "ignoring unknown message kind");
            return Ok(None);
        }
        if envelope.kind.is_server_only() {
            return Err(ParleyError::Protocol(format!(
                "{} is not a client message",
                envelope.kind
            )));
        }

        match &envelope.kind {
            MsgKind::Login => return self.login(&envelope).await,
            MsgKind::Register => return self.register(&envelope).await,
            _ => {}
        }

        let Some(username) = self.username().map(str::to_owned) else {
            return Err(ParleyError::Protocol(format!(
                "{} before authentication",
                envelope.kind
            )));
        };

        match &envelope.kind {
            MsgKind::Chat => self.chat(&username, &envelope).await,
            MsgKind::FindUser => self.find_user(&envelope).await,
            MsgKind::GetConnection => self.presence(&envelope).await,
            MsgKind::GetMessages => self.history(&username, &envelope).await,
            MsgKind::GetChats => self.chats(&username).await,
            other => Err(ParleyError::Protocol(format!("unexpected {other}"))),
        }
    }

    // ── Authentication ─────────────────────────────────────────────────

    async fn login(&mut self, envelope: &Envelope) -> ParleyResult<Option<Envelope>> {
        let creds: Credentials = decode_payload(envelope)?;
        validate_username(&creds.username)?;

        let name = creds.username.clone();
        let stored = with_store(&self.relay.store, move |s| {
            if s.user_exists(&name)? {
                s.password_hash(&name).map(Some)
            } else {
                Ok(None)
            }
        })
        .await?;

        let Some(hash) = stored else {
            debug!(conn_id = %self.handle.id(), username = %creds.username, "login for unknown user");
            return Ok(Some(Envelope::error(ErrorReason::UserNotFound)));
        };

        let password = creds.password;
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| ParleyError::Other(format!("password check failed: {e}")))?;
        if !verified {
            info!(conn_id = %self.handle.id(), username = %creds.username, "login rejected: incorrect password");
            return Ok(Some(Envelope::error(ErrorReason::IncorrectPassword)));
        }

        self.authenticate(creds.username).await;
        Ok(Some(Envelope::ok()))
    }

    async fn register(&mut self, envelope: &Envelope) -> ParleyResult<Option<Envelope>> {
        let creds: Credentials = decode_payload(envelope)?;
        validate_username(&creds.username)?;

        let password = creds.password;
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| ParleyError::Other(format!("password hashing failed: {e}")))??;

        let user = NewUser {
            username: creds.username.clone(),
            email: creds.email,
            password_hash,
        };
        match with_store(&self.relay.store, move |s| s.insert_user(&user)).await {
            Ok(()) => {}
            Err(StoreError::ConstraintViolation(_)) => {
                info!(conn_id = %self.handle.id(), username = %creds.username, "registration rejected: username taken");
                return Ok(Some(Envelope::error(ErrorReason::UsernameTaken)));
            }
            Err(e) => return Err(e.into()),
        }

        info!(conn_id = %self.handle.id(), username = %creds.username, "user registered");
        self.authenticate(creds.username).await;
        Ok(Some(Envelope::ok()))
    }

    /// Move to `Authenticated` and claim the username in the registry,
    /// closing whichever connection held it before.
    async fn authenticate(&mut self, username: String) {
        let outcome = self
            .relay
            .registry
            .register(self.handle.clone(), username.clone())
            .await;
        if let Some(previous) = &outcome.previous_username {
            info!(
                conn_id = %self.handle.id(),
                from = %previous,
                to = %username,
                "connection switched identity"
            );
        }
        if let Some(old) = outcome.displaced {
            info!(
                username = %username,
                old_conn = %old.id(),
                new_conn = %self.handle.id(),
                "closing displaced connection"
            );
            old.close();
        }
        self.state = SessionState::Authenticated { username };
    }

    // ── Authenticated requests ─────────────────────────────────────────

    async fn chat(&self, username: &str, envelope: &Envelope) -> ParleyResult<Option<Envelope>> {
        let message: ChatMessage = decode_payload(envelope)?;
        let report = self.relay.router.route(username, message).await;
        Ok(Some(report.reply))
    }

    async fn find_user(&self, envelope: &Envelope) -> ParleyResult<Option<Envelope>> {
        let query: TextPayload = decode_payload(envelope)?;
        let name = query.payload;
        let exists = with_store(&self.relay.store, move |s| s.resolve_username(&name)).await?;
        Ok(Some(if exists {
            Envelope::ok()
        } else {
            Envelope::error(ErrorReason::UserNotFound)
        }))
    }

    /// Presence comes from the registry, never from storage.
    async fn presence(&self, envelope: &Envelope) -> ParleyResult<Option<Envelope>> {
        let query: PresenceQuery = decode_wrapped(envelope)?;
        let online = self.relay.registry.presence(&query.users).await;
        Ok(Some(Envelope::reply(
            MsgKind::GetConnection,
            serde_json::to_value(online)?,
        )))
    }

    async fn history(&self, username: &str, envelope: &Envelope) -> ParleyResult<Option<Envelope>> {
        let query: HistoryQuery = decode_wrapped(envelope)?;
        let other = if query.user1 == username {
            query.user2
        } else if query.user2 == username {
            query.user1
        } else {
            return Ok(Some(Envelope::error(ErrorReason::NotAParticipant)));
        };

        let viewer = username.to_string();
        let entries = with_store(&self.relay.store, move |s| s.conversation(&viewer, &other)).await?;
        Ok(Some(Envelope::reply(
            MsgKind::GetMessages,
            serde_json::to_value(entries)?,
        )))
    }

    async fn chats(&self, username: &str) -> ParleyResult<Option<Envelope>> {
        let me = username.to_string();
        let partners = with_store(&self.relay.store, move |s| s.conversation_partners(&me)).await?;
        Ok(Some(Envelope::reply(
            MsgKind::GetChats,
            serde_json::to_value(partners)?,
        )))
    }
}

fn validate_username(username: &str) -> ParleyResult<()> {
    if username.trim().is_empty() {
        return Err(ParleyError::InvalidMessage("empty username".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DEFAULT_PUSH_TIMEOUT;
    use crate::session::Outbound;
    use crate::store::{ChatStore, SqliteStore, StoreResult, StoredMessage};
    use parley_core::messages::HistoryEntry;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    struct TestConn {
        dispatcher: Dispatcher,
        rx: mpsc::Receiver<Outbound>,
        close: Arc<Notify>,
    }

    fn relay() -> RelayState {
        RelayState::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            DEFAULT_PUSH_TIMEOUT,
        )
    }

    fn connect(relay: &RelayState) -> TestConn {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (handle, rx, close) = ConnectionHandle::new(addr, 8);
        TestConn {
            dispatcher: Dispatcher::new(handle, relay.clone()),
            rx,
            close,
        }
    }

    fn creds(kind: MsgKind, user: &str, pw: &str) -> Envelope {
        Envelope::new(
            kind,
            json!({ "username": user, "email": format!("{user}@x.com"), "password": pw }),
        )
    }

    async fn send(conn: &mut TestConn, env: Envelope) -> Envelope {
        conn.dispatcher.dispatch(env).await.unwrap().expect("reply")
    }

    #[tokio::test]
    async fn register_then_duplicate() {
        let relay = relay();
        let mut a = connect(&relay);
        let reply = send(&mut a, creds(MsgKind::Register, "bob", "pw")).await;
        assert_eq!(reply.kind, MsgKind::Ok);
        assert_eq!(a.dispatcher.username(), Some("bob"));

        let mut b = connect(&relay);
        let reply = send(&mut b, creds(MsgKind::Register, "bob", "other")).await;
        assert_eq!(reply.text_payload(), Some("username_taken"));
        assert_eq!(b.dispatcher.state(), &SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn login_paths() {
        let relay = relay();
        let mut a = connect(&relay);
        send(&mut a, creds(MsgKind::Register, "bob", "pw")).await;

        let mut b = connect(&relay);
        let reply = send(&mut b, creds(MsgKind::Login, "nobody", "pw")).await;
        assert_eq!(reply.text_payload(), Some("user_not_found"));
        let reply = send(&mut b, creds(MsgKind::Login, "bob", "wrong")).await;
        assert_eq!(reply.text_payload(), Some("incorrect_password"));
        assert_eq!(b.dispatcher.state(), &SessionState::Unauthenticated);

        let reply = send(&mut b, creds(MsgKind::Login, "bob", "pw")).await;
        assert_eq!(reply.kind, MsgKind::Ok);
        assert_eq!(b.dispatcher.username(), Some("bob"));
    }

    #[tokio::test]
    async fn second_login_closes_displaced_connection() {
        let relay = relay();
        let mut a = connect(&relay);
        send(&mut a, creds(MsgKind::Register, "bob", "pw")).await;
        let mut b = connect(&relay);
        send(&mut b, creds(MsgKind::Login, "bob", "pw")).await;

        tokio::time::timeout(Duration::from_secs(1), a.close.notified())
            .await
            .expect("displaced connection was not closed");
        let live = relay.registry.lookup("bob").await.unwrap();
        assert_eq!(live.id(), b.dispatcher.handle.id());
    }

    #[tokio::test]
    async fn non_auth_kind_before_login_is_fatal() {
        let relay = relay();
        let mut a = connect(&relay);
        let env = Envelope::new(MsgKind::FindUser, json!({ "payload": "bob" }));
        let err = a.dispatcher.dispatch(env).await.unwrap_err();
        assert!(matches!(err, ParleyError::Protocol(_)));
    }

    /// Store whose every call fails at the backend.
    struct DownStore;

    impl ChatStore for DownStore {
        fn insert_user(&self, _: &NewUser) -> StoreResult<()> {
            Err(StoreError::Backend("down".into()))
        }
        fn user_exists(&self, _: &str) -> StoreResult<bool> {
            Err(StoreError::Backend("down".into()))
        }
        fn password_hash(&self, _: &str) -> StoreResult<String> {
            Err(StoreError::Backend("down".into()))
        }
        fn insert_message(&self, _: &StoredMessage) -> StoreResult<()> {
            Err(StoreError::Backend("down".into()))
        }
        fn conversation(&self, _: &str, _: &str) -> StoreResult<Vec<HistoryEntry>> {
            Err(StoreError::Backend("down".into()))
        }
        fn conversation_partners(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn storage_failure_during_auth_is_fatal() {
        let relay = RelayState::new(Arc::new(DownStore), DEFAULT_PUSH_TIMEOUT);
        let mut a = connect(&relay);

        let err = a
            .dispatcher
            .dispatch(creds(MsgKind::Register, "bob", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Storage(_)));

        let err = a
            .dispatcher
            .dispatch(creds(MsgKind::Login, "bob", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Storage(_)));

        assert_eq!(a.dispatcher.state(), &SessionState::Unauthenticated);
        assert_eq!(relay.registry.count().await, 0);
    }

    #[tokio::test]
    async fn blank_username_is_fatal() {
        let relay = relay();
        let mut a = connect(&relay);
        let err = a
            .dispatcher
            .dispatch(creds(MsgKind::Register, "  ", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::InvalidMessage(_)));
        assert_eq!(relay.registry.count().await, 0);
    }

    #[tokio::test]
    async fn relogin_switches_identity() {
        let relay = relay();
        let mut a = connect(&relay);
        send(&mut a, creds(MsgKind::Register, "alice", "pw")).await;
        send(&mut a, creds(MsgKind::Register, "bob", "pw")).await;
        assert_eq!(a.dispatcher.username(), Some("bob"));
        assert!(relay.registry.lookup("alice").await.is_none());
        assert_eq!(relay.registry.identity_of(a.dispatcher.handle.id()).await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored() {
        let relay = relay();
        let mut a = connect(&relay);
        let env = Envelope::new(MsgKind::Unknown("typing".into()), json!(null));
        assert!(a.dispatcher.dispatch(env).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_only_kind_is_fatal() {
        let relay = relay();
        let mut a = connect(&relay);
        send(&mut a, creds(MsgKind::Register, "bob", "pw")).await;
        let err = a.dispatcher.dispatch(Envelope::ok()).await.unwrap_err();
        assert!(matches!(err, ParleyError::Protocol(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal() {
        let relay = relay();
        let mut a = connect(&relay);
        let env = Envelope::new(MsgKind::Login, json!({ "user": "bob" }));
        let err = a.dispatcher.dispatch(env).await.unwrap_err();
        assert!(matches!(err, ParleyError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn find_user_and_presence() {
        let relay = relay();
        let mut a = connect(&relay);
        send(&mut a, creds(MsgKind::Register, "alice", "pw")).await;
        let mut b = connect(&relay);
        send(&mut b, creds(MsgKind::Register, "bob", "pw")).await;

        let found = send(&mut a, Envelope::new(MsgKind::FindUser, json!({ "payload": "bob" }))).await;
        assert_eq!(found.kind, MsgKind::Ok);
        let missing =
            send(&mut a, Envelope::new(MsgKind::FindUser, json!({ "payload": "carol" }))).await;
        assert_eq!(missing.text_payload(), Some("user_not_found"));

        let presence = send(
            &mut a,
            Envelope::new(
                MsgKind::GetConnection,
                json!({ "payload": { "users": ["bob", "carol"] } }),
            ),
        )
        .await;
        assert_eq!(presence.kind, MsgKind::GetConnection);
        assert_eq!(presence.payload["payload"], json!({ "bob": true, "carol": false }));
    }

    #[tokio::test]
    async fn chat_history_and_partners() {
        let relay = relay();
        let mut a = connect(&relay);
        send(&mut a, creds(MsgKind::Register, "alice", "pw")).await;
        let mut b = connect(&relay);
        send(&mut b, creds(MsgKind::Register, "bob", "pw")).await;

        let chat = Envelope::new(
            MsgKind::Chat,
            json!({ "send": "alice", "recv": "bob", "msg": "hi", "created_at": "2026-01-01T00:00:00Z" }),
        );
        let ack = send(&mut a, chat).await;
        assert_eq!(ack.kind, MsgKind::MessageSent);
        assert!(matches!(b.rx.recv().await, Some(Outbound::Send(e)) if e.kind == MsgKind::MessageReceived));

        let history = send(
            &mut b,
            Envelope::new(
                MsgKind::GetMessages,
                json!({ "payload": "{\"user1\":\"bob\",\"user2\":\"alice\"}" }),
            ),
        )
        .await;
        let entries: Vec<HistoryEntry> =
            serde_json::from_value(history.payload["payload"].clone()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "hi");
        assert_eq!(entries[0].direction, parley_core::messages::Direction::Received);

        let chats = send(&mut a, Envelope::new(MsgKind::GetChats, json!(null))).await;
        assert_eq!(chats.payload["payload"], json!(["bob"]));
    }

    #[tokio::test]
    async fn history_of_someone_elses_pair_is_refused() {
        let relay = relay();
        let mut a = connect(&relay);
        send(&mut a, creds(MsgKind::Register, "mallory", "pw")).await;
        let reply = send(
            &mut a,
            Envelope::new(
                MsgKind::GetMessages,
                json!({ "payload": { "user1": "alice", "user2": "bob" } }),
            ),
        )
        .await;
        assert_eq!(reply.text_payload(), Some("not_a_participant"));
    }
}
