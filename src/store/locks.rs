//! Per-user write serialization.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per username.
///
/// Holding the guard for a username is required for any load-modify-save of
/// that user's record. Different usernames never contend.
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `username`, waiting if another writer holds it.
    pub async fn lock(&self, username: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry for a deleted user.
    pub fn forget(&self, username: &str) {
        self.locks.remove(username);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_user_is_serialized() {
        let locks = UserLocks::new();
        let _guard = locks.lock("ana").await;

        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock("ana")).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_different_users_do_not_contend() {
        let locks = UserLocks::new();
        let _guard = locks.lock("ana").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("bo")).await;
        assert!(other.is_ok());
    }
}
