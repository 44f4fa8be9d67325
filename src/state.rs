//! Shared application state injected into every axum handler.

use crate::config::ConfigStore;
use crate::conversation::ConversationStore;

/// `ModelClient` is intentionally not cached here: it is cheap to build and
/// depends on `backend_mode`/`backend_base_url`, both of which can change
/// via `/api/config` or `/api/config/reload`. Handlers build one from the
/// config snapshot they already captured for the request.
pub struct AppState {
    pub config_store: ConfigStore,
    pub conversations: ConversationStore,
}
