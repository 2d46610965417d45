use crate::router::MessageRouter;
use crate::session::SessionRegistry;
use crate::store::SharedStore;
use std::sync::Arc;
use std::time::Duration;

/// Shared services handed to every connection task.
#[derive(Clone)]
pub struct RelayState {
    /// Authenticated sessions.
    pub registry: Arc<SessionRegistry>,
    /// Persistence gateway.
    pub store: SharedStore,
    /// Chat store-and-forward.
    pub router: Arc<MessageRouter>,
}

impl RelayState {
    pub fn new(store: SharedStore, push_timeout: Duration) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(
            MessageRouter::new(registry.clone(), store.clone()).with_push_timeout(push_timeout),
        );
        Self {
            registry,
            store,
            router,
        }
    }
}
