//! Application state shared across all request handlers.

use std::sync::Arc;

use crate::accounts::AccountService;
use crate::auth::session::SessionGate;
use crate::config::RelayConfig;
use crate::conversation::manager::ConversationManager;
use crate::error::RelayResult;
use crate::llm::{CompletionBackend, CompletionClient};
use crate::store::locks::UserLocks;
use crate::store::user_store::{SqliteUserStore, UserStore};

/// Shared application state.
pub struct AppState {
    /// Validated runtime configuration.
    pub config: RelayConfig,
    /// Live sessions.
    pub gate: Arc<SessionGate>,
    /// Registration, login and admin actions.
    pub accounts: AccountService,
    /// Conversation listing, selection and chat turns.
    pub conversations: ConversationManager,
    /// Upstream completion service.
    pub completion: Arc<dyn CompletionBackend>,
}

impl AppState {
    /// Open the configured store and upstream client.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or the HTTP client
    /// cannot be built.
    pub async fn new(config: RelayConfig) -> RelayResult<Arc<Self>> {
        let store = SqliteUserStore::new(&config.storage).await?;
        let completion = CompletionClient::new(&config.upstream)?;
        Ok(Self::with_parts(config, Arc::new(store), Arc::new(completion)))
    }

    /// Assemble state from an existing store and completion backend.
    #[must_use]
    pub fn with_parts(
        config: RelayConfig,
        store: Arc<dyn UserStore>,
        completion: Arc<dyn CompletionBackend>,
    ) -> Arc<Self> {
        let locks = Arc::new(UserLocks::new());
        let gate = Arc::new(SessionGate::with_idle_timeout(config.server.session_idle_timeout));
        let accounts = AccountService::new(Arc::clone(&store), Arc::clone(&locks), Arc::clone(&gate));
        let conversations = ConversationManager::new(
            store,
            locks,
            Arc::clone(&completion),
            config.upstream.model.clone(),
        );

        Arc::new(Self {
            config,
            gate,
            accounts,
            conversations,
            completion,
        })
    }
}
