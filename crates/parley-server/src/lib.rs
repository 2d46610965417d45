//! parley-server: one-to-one chat relay over WebSocket.
//!
//! Clients register or log in on a WebSocket, then exchange direct messages
//! that are persisted to SQLite and pushed live when the recipient is online.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod router;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;
