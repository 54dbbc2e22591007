use std::sync::Arc;

use relay_domain::Config;
use relay_sessions::SessionRegistry;
use tokio::sync::Mutex as AsyncMutex;

use crate::runtime::overrides::ConversationOverrides;
use crate::runtime::turn::TurnCoordinator;

/// Shared service state, handed to every frontend adapter.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub overrides: Arc<ConversationOverrides>,
    pub turns: Arc<TurnCoordinator>,
    /// Serializes the HTTP-bridge "debug" conversation end-to-end so
    /// capacity decisions stay deterministic under rapid single-user
    /// requests. The WS path does not use this; per-Session locking is
    /// sufficient there.
    pub http_mutex: Arc<AsyncMutex<()>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>) -> Self {
        let overrides = Arc::new(ConversationOverrides::default());
        let turns = Arc::new(TurnCoordinator::new(
            registry.clone(),
            overrides.clone(),
            config.clone(),
        ));
        Self {
            config,
            registry,
            overrides,
            turns,
            http_mutex: Arc::new(AsyncMutex::new(())),
        }
    }
}
