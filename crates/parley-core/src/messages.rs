//! Envelope and payload types for the parley wire protocol.
//!
//! Every frame on the wire is a JSON object `{"type": <kind>, "payload": <json>}`.
//! The payload is opaque to the envelope; each handler decodes the shape it
//! expects with [`crate::codec::decode_payload`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message kind tags. Strings must match the desktop client's constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MsgKind {
    Login,
    Register,
    Chat,
    FindUser,
    GetConnection,
    GetMessages,
    GetChats,

    Ok,
    Error,
    MessageReceived,
    MessageSent,
    Exit,

    /// Anything we do not recognize; kept so it can be logged.
    Unknown(String),
}

impl MsgKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::Chat => "chat",
            Self::FindUser => "find_user",
            Self::GetConnection => "get_connection",
            Self::GetMessages => "get_messages",
            Self::GetChats => "get_chats",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::MessageReceived => "message_received",
            Self::MessageSent => "message_sent",
            Self::Exit => "exit",
            Self::Unknown(s) => s,
        }
    }

    /// Kinds only the server emits.
    pub fn is_server_only(&self) -> bool {
        matches!(
            self,
            Self::Ok | Self::Error | Self::MessageReceived | Self::MessageSent | Self::Exit
        )
    }
}

impl From<MsgKind> for String {
    fn from(k: MsgKind) -> String {
        match k {
            MsgKind::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl From<String> for MsgKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "login" => Self::Login,
            "register" => Self::Register,
            "chat" => Self::Chat,
            "find_user" => Self::FindUser,
            "get_connection" => Self::GetConnection,
            "get_messages" => Self::GetMessages,
            "get_chats" => Self::GetChats,
            "ok" => Self::Ok,
            "error" => Self::Error,
            "message_received" => Self::MessageReceived,
            "message_sent" => Self::MessageSent,
            "exit" => Self::Exit,
            _ => Self::Unknown(s),
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire unit: a kind tag wrapping an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MsgKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: MsgKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// `ok` reply: `{"payload": "ok"}`.
    pub fn ok() -> Self {
        Self::text(MsgKind::Ok, "ok")
    }

    /// Typed `error` reply carrying a reason string.
    pub fn error(reason: ErrorReason) -> Self {
        Self::text(MsgKind::Error, reason.as_str())
    }

    /// Acknowledgment to the sender of a chat message.
    pub fn message_sent() -> Self {
        Self::text(MsgKind::MessageSent, "ok")
    }

    /// Unsolicited push of a chat message to its recipient.
    pub fn message_received(msg: &ChatMessage) -> Self {
        Self {
            kind: MsgKind::MessageReceived,
            payload: serde_json::to_value(msg).unwrap_or(Value::Null),
        }
    }

    /// Session-terminated signal broadcast at shutdown.
    pub fn exit() -> Self {
        Self::text(MsgKind::Exit, "exit")
    }

    /// Reply to a query, echoing the request kind: `{"payload": <result>}`.
    pub fn reply(kind: MsgKind, result: Value) -> Self {
        Self {
            kind,
            payload: serde_json::json!({ "payload": result }),
        }
    }

    fn text(kind: MsgKind, text: &str) -> Self {
        Self {
            kind,
            payload: serde_json::json!({ "payload": text }),
        }
    }

    /// The string inside a `{"payload": "..."}` wrapper, if that is the shape.
    pub fn text_payload(&self) -> Option<&str> {
        self.payload.get("payload").and_then(Value::as_str)
    }
}

/// Reasons carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    UsernameTaken,
    UserNotFound,
    IncorrectPassword,
    NotAParticipant,
    StorageFailure,
}

impl ErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UsernameTaken => "username_taken",
            Self::UserNotFound => "user_not_found",
            Self::IncorrectPassword => "incorrect_password",
            Self::NotAParticipant => "not_a_participant",
            Self::StorageFailure => "storage_failure",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payloads ────────────────────────────────────────────────────────────

/// `login` / `register` payload. Email is ignored on login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(alias = "passowrd")]
    pub password: String,
}

/// `chat` payload, also the body of `message_received`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub send: String,
    pub recv: String,
    pub msg: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(send: impl Into<String>, recv: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            send: send.into(),
            recv: recv.into(),
            msg: msg.into(),
            created_at: Utc::now(),
        }
    }
}

/// `{"payload": "<text>"}`, the body of `find_user` and of text replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    pub payload: String,
}

/// Generic `{"payload": ...}` wrapper used by the query kinds.
///
/// The legacy desktop client JSON-encodes query objects into the string, so
/// [`crate::codec::decode_wrapped`] accepts both shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedPayload {
    pub payload: Value,
}

/// `get_connection` query: which of these users are online?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceQuery {
    pub users: Vec<String>,
}

/// `get_messages` query: the conversation between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub user1: String,
    pub user2: String,
}

/// Direction of a history entry relative to the querying identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

/// One entry of a `get_messages` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}
