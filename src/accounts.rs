//! Account lifecycle: registration, login, admin actions and bootstrap.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::password::{hash_password, verify_password};
use crate::auth::session::{Session, SessionGate};
use crate::config::{DEFAULT_ADMIN_PASSWORD, StorageConfig};
use crate::error::{RelayError, RelayResult};
use crate::store::collection::{export_collection, import_collection};
use crate::store::locks::UserLocks;
use crate::store::records::{UserRecord, UserRole};
use crate::store::user_store::UserStore;

/// Name of the account created when the store starts empty.
pub const BOOTSTRAP_ADMIN: &str = "admin";

/// Row of the admin user listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserOverview {
    /// Account name.
    pub username: String,
    /// Account role.
    pub role: UserRole,
    /// Number of stored conversations.
    pub conversations: usize,
}

/// How the store was seeded at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootstrapOutcome {
    /// The store already had accounts.
    Existing,
    /// Records were imported from a collection document.
    Imported(usize),
    /// The default admin account was created.
    AdminCreated,
}

/// Account operations over the user store and the session gate.
pub struct AccountService {
    store: Arc<dyn UserStore>,
    locks: Arc<UserLocks>,
    gate: Arc<SessionGate>,
}

impl AccountService {
    /// Create an account service.
    #[must_use]
    pub fn new(store: Arc<dyn UserStore>, locks: Arc<UserLocks>, gate: Arc<SessionGate>) -> Self {
        Self { store, locks, gate }
    }

    /// Register a new `user` account.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for empty fields or mismatched confirmation,
    /// `Conflict` if the username is taken.
    pub async fn register(&self, username: &str, password: &str, confirm: &str) -> RelayResult<String> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(RelayError::InvalidRequest(
                "Username and password are required".to_string(),
            ));
        }
        if password != confirm {
            return Err(RelayError::InvalidRequest("Passwords do not match".to_string()));
        }

        let record = UserRecord::new(username, hash_password(password)?, UserRole::User);
        if !self.store.insert_new(&record).await? {
            return Err(RelayError::Conflict("Username already exists".to_string()));
        }

        info!("registered user {username}");
        Ok(username.to_string())
    }

    /// Verify credentials and open a session.
    ///
    /// # Errors
    /// Returns `AuthRequired` for unknown users or wrong passwords.
    pub async fn login(&self, username: &str, password: &str) -> RelayResult<Arc<Session>> {
        let username = username.trim();
        let Some(user) = self.store.get(username).await? else {
            warn!("login attempt for unknown user {username}");
            return Err(RelayError::AuthRequired);
        };
        match verify_password(password, &user.password_hash) {
            Ok(true) => {}
            Ok(false) => {
                warn!("failed login for {username}");
                return Err(RelayError::AuthRequired);
            }
            Err(err) => {
                warn!("unusable credential for {username}: {err}");
                return Err(RelayError::AuthRequired);
            }
        }

        let session = self.gate.open(&user.username, user.role);
        info!("{} logged in as {}", user.username, user.role);
        Ok(session)
    }

    /// Close the given session.
    pub fn logout(&self, session: &Session) {
        if self.gate.close(session.token) {
            info!("{} logged out", session.username);
        }
    }

    /// Overview of every account.
    ///
    /// # Errors
    /// Returns `Forbidden` for non-admin sessions, or a storage error.
    pub async fn list_users(&self, session: &Session) -> RelayResult<Vec<UserOverview>> {
        session.require_admin()?;
        let users = self.store.list().await?;
        Ok(users
            .into_iter()
            .map(|user| UserOverview {
                conversations: user.conversations.len(),
                username: user.username,
                role: user.role,
            })
            .collect())
    }

    /// Delete an account and close all of its sessions.
    ///
    /// # Errors
    /// Returns `Forbidden` for non-admin sessions, `NotFound` for unknown
    /// users, or a storage error.
    pub async fn delete_user(&self, session: &Session, username: &str) -> RelayResult<()> {
        session.require_admin()?;

        let deleted = {
            let _guard = self.locks.lock(username).await;
            self.store.delete(username).await?
        };
        if !deleted {
            return Err(RelayError::NotFound("User not found".to_string()));
        }

        let closed = self.gate.close_user(username);
        self.locks.forget(username);
        info!("{} deleted user {username} ({closed} sessions closed)", session.username);
        Ok(())
    }

    /// Full collection document of all accounts.
    ///
    /// # Errors
    /// Returns `Forbidden` for non-admin sessions, or a storage error.
    pub async fn export(&self, session: &Session) -> RelayResult<Vec<UserRecord>> {
        session.require_admin()?;
        export_collection(self.store.as_ref()).await
    }

    /// Seed an empty store from the configured collection or a default admin.
    ///
    /// # Errors
    /// Returns an error if the import file is unreadable or storage fails.
    pub async fn bootstrap(&self, config: &StorageConfig) -> RelayResult<BootstrapOutcome> {
        if self.store.count().await? > 0 {
            return Ok(BootstrapOutcome::Existing);
        }

        if let Some(path) = config.import_users_path.as_deref() {
            if tokio::fs::try_exists(path).await? {
                let imported = import_collection(self.store.as_ref(), path).await?;
                if imported > 0 {
                    return Ok(BootstrapOutcome::Imported(imported));
                }
            } else {
                warn!("user collection {} not found, skipping import", path.display());
            }
        }

        let password = match config.admin_password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => password,
            None => {
                warn!("creating {BOOTSTRAP_ADMIN} with the default password; set RELAY_ADMIN_PASSWORD");
                DEFAULT_ADMIN_PASSWORD
            }
        };
        let admin = UserRecord::new(BOOTSTRAP_ADMIN, hash_password(password)?, UserRole::Admin);
        self.store.insert_new(&admin).await?;
        info!("created bootstrap account {BOOTSTRAP_ADMIN}");
        Ok(BootstrapOutcome::AdminCreated)
    }
}
