//! Runtime configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::session::DEFAULT_SESSION_IDLE_TIMEOUT;
use crate::error::{RelayError, RelayResult};

/// Environment variable for the upstream root URL.
pub const BASE_URL_ENV: &str = "OLLAMA_BASE_URL";
/// Environment variable for the default model identifier.
pub const MODEL_ENV: &str = "OLLAMA_MODEL";
/// Environment variable for the optional bearer token.
pub const API_KEY_ENV: &str = "OLLAMA_API_KEY";
/// Environment variable for the listen port.
pub const PORT_ENV: &str = "RELAY_PORT";
/// Environment variable for the `SQLite` database path.
pub const DB_PATH_ENV: &str = "RELAY_DB_PATH";
/// Environment variable for the static asset directory.
pub const STATIC_DIR_ENV: &str = "RELAY_STATIC_DIR";
/// Environment variable pointing at a legacy `users.json` collection.
pub const IMPORT_USERS_ENV: &str = "RELAY_IMPORT_USERS";
/// Environment variable for the bootstrap admin password.
pub const ADMIN_PASSWORD_ENV: &str = "RELAY_ADMIN_PASSWORD";
/// Environment variable for the session idle timeout in seconds.
pub const SESSION_IDLE_ENV: &str = "RELAY_SESSION_IDLE_SECS";

/// Default upstream root.
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
/// Default model identifier.
const DEFAULT_MODEL: &str = "gpt-oss-20b";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 5000;
/// Password used for the bootstrap admin when none is configured.
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin";

/// Top-level relay configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream completion service settings.
    pub upstream: UpstreamConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
}

impl RelayConfig {
    /// Build a configuration from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            config.upstream.base_url = base_url;
        }
        if let Ok(model) = std::env::var(MODEL_ENV) {
            config.upstream.model = model;
        }
        config.upstream.api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty());

        if let Some(port) = std::env::var(PORT_ENV).ok().and_then(|p| p.parse().ok()) {
            config.server.port = port;
        }
        if let Some(secs) = std::env::var(SESSION_IDLE_ENV).ok().and_then(|s| s.parse().ok()) {
            config.server.session_idle_timeout = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var(STATIC_DIR_ENV) {
            config.server.static_dir = PathBuf::from(dir);
        }

        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            config.storage.sqlite_path = PathBuf::from(path);
        }
        config.storage.import_users_path = std::env::var(IMPORT_USERS_ENV).ok().map(PathBuf::from);
        config.storage.admin_password = std::env::var(ADMIN_PASSWORD_ENV).ok();

        config
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> RelayResult<()> {
        Url::parse(&self.upstream.base_url)?;

        if self.upstream.model.trim().is_empty() {
            return Err(RelayError::Config("upstream.model must not be empty".to_string()));
        }

        if self.server.port == 0 {
            return Err(RelayError::Config("server.port must be > 0".to_string()));
        }

        if self.server.session_idle_timeout.is_zero() {
            return Err(RelayError::Config("server.session_idle_timeout must be > 0".to_string()));
        }

        if self.upstream.completion_timeout.is_zero() || self.upstream.listing_timeout.is_zero() {
            return Err(RelayError::Config("upstream timeouts must be > 0".to_string()));
        }

        Ok(())
    }
}

/// Upstream completion service settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Root URL of the completion service.
    pub base_url: String,
    /// Default model identifier.
    pub model: String,
    /// Optional bearer token.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Timeout for TCP connect.
    pub connect_timeout: Duration,
    /// Timeout for model listing calls.
    pub listing_timeout: Duration,
    /// Timeout for completion calls; generation latency is unbounded.
    pub completion_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            listing_timeout: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(300),
        }
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// Directory served as the router fallback.
    pub static_dir: PathBuf,
    /// Idle time after which a session token stops resolving.
    pub session_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            static_dir: PathBuf::from("static"),
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
        }
    }
}

/// Storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
    /// User table name.
    pub user_table: String,
    /// Legacy collection document imported when the store is empty.
    pub import_users_path: Option<PathBuf>,
    /// Password for the bootstrap admin account.
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("relay.sqlite"),
            user_table: "relay_users".to_string(),
            import_users_path: None,
            admin_password: None,
        }
    }
}
