//! Message router: store-and-forward for direct chat messages.
//!
//! A message is persisted first and only then offered to the recipient's live
//! connection, if there is one. Live delivery is best-effort; the sender's
//! acknowledgment depends on persistence alone.

use crate::session::{PushError, SessionRegistry};
use crate::store::{with_store, SharedStore, StoreError, StoredMessage};
use parley_core::messages::ChatMessage;
use parley_core::{Envelope, ErrorReason};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened to the live-delivery half of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed onto the recipient's connection.
    Live,
    /// Recipient has no live connection; it will see the message in history.
    Offline,
    /// Push failed (connection gone, or its queue stayed full past the push
    /// timeout); the recipient connection was torn down.
    Failed(PushError),
    /// Persistence did not succeed, so delivery was never attempted.
    NotAttempted,
}

/// Result of routing one chat message.
#[derive(Debug)]
pub struct RouteReport {
    /// Reply for the sender.
    pub reply: Envelope,
    pub delivery: Delivery,
}

/// How long a push waits on a recipient's full queue by default.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Routes chat messages between authenticated users.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    store: SharedStore,
    push_timeout: Duration,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, store: SharedStore) -> Self {
        Self {
            registry,
            store,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }

    /// A recipient whose queue stays full for longer than `timeout` is
    /// treated as dead.
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// Persist `message`, deliver it to the recipient if online, and build
    /// the sender's reply.
    ///
    /// `sender` is the authenticated identity; it wins over the payload's
    /// `send` field.
    pub async fn route(&self, sender: &str, mut message: ChatMessage) -> RouteReport {
        if message.send != sender {
            warn!(claimed = %message.send, sender = %sender, "chat sender does not match session, overriding");
            message.send = sender.to_string();
        }

        let stored = StoredMessage::from(&message);
        match with_store(&self.store, move |s| s.insert_message(&stored)).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                debug!(sender = %sender, recipient = %message.recv, "chat to unknown user");
                return RouteReport {
                    reply: Envelope::error(ErrorReason::UserNotFound),
                    delivery: Delivery::NotAttempted,
                };
            }
            Err(e) => {
                warn!(sender = %sender, recipient = %message.recv, error = %e, "failed to persist chat message");
                return RouteReport {
                    reply: Envelope::error(ErrorReason::StorageFailure),
                    delivery: Delivery::NotAttempted,
                };
            }
        }

        let delivery = match self.registry.lookup(&message.recv).await {
            None => Delivery::Offline,
            Some(target) => match target
                .push(Envelope::message_received(&message), self.push_timeout)
                .await
            {
                Ok(()) => Delivery::Live,
                Err(e) => {
                    warn!(
                        recipient = %message.recv,
                        conn_id = %target.id(),
                        reason = ?e,
                        "push to recipient failed, dropping its connection"
                    );
                    self.registry.unregister(target.id()).await;
                    target.close();
                    Delivery::Failed(e)
                }
            },
        };

        info!(sender = %sender, recipient = %message.recv, delivery = ?delivery, "chat routed");
        RouteReport {
            reply: Envelope::message_sent(),
            delivery,
        }
    }
}
