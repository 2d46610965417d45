//! Live connections and the registry of authenticated sessions.

pub mod connection;
pub mod registry;

pub use connection::{ConnId, ConnectionHandle, Outbound, PushError};
pub use registry::{Registration, Session, SessionRegistry};
