//! Startup helpers for the chat relay server.

use std::process::ExitCode;
use std::sync::Arc;

use crate::accounts::BootstrapOutcome;
use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::server::{self, AppState};

/// Run the server until ctrl-c (used by `chat-relay-server`).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting chat relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        return ExitCode::from(1);
    }
    tracing::info!("LLM endpoint: {} (model {})", config.upstream.base_url, config.upstream.model);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = rt.block_on(async {
        let state = initialize(config).await?;
        server::run_server_with_shutdown(state, shutdown_signal()).await
    });

    if let Err(e) = result {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    tracing::info!("chat relay stopped");
    ExitCode::SUCCESS
}

/// Build application state and seed an empty account store.
///
/// # Errors
/// Returns an error if the store cannot be opened or seeded.
pub async fn initialize(config: RelayConfig) -> RelayResult<Arc<AppState>> {
    let state = AppState::new(config).await?;
    match state.accounts.bootstrap(&state.config.storage).await? {
        BootstrapOutcome::Existing => {}
        BootstrapOutcome::Imported(count) => tracing::info!("seeded store with {count} imported users"),
        BootstrapOutcome::AdminCreated => tracing::info!("seeded store with the admin account"),
    }
    Ok(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
    }
    tracing::info!("shutdown requested");
}
