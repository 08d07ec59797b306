//! Per-user record storage.
//!
//! Each account is one row keyed by username, so a mutation rewrites only
//! that user's record. Writers must hold the user's lock (see
//! [`UserLocks`](super::locks::UserLocks)) across load and save.

use std::future::Future;
use std::pin::Pin;

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use crate::config::StorageConfig;
use crate::error::{RelayError, RelayResult};
use crate::store::records::UserRecord;

/// Boxed future type for user store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User record store trait.
pub trait UserStore: Send + Sync {
    /// Get a user record by username.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get(&self, username: &str) -> StoreFuture<'_, RelayResult<Option<UserRecord>>>;

    /// Insert or replace a user record.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn save(&self, record: &UserRecord) -> StoreFuture<'_, RelayResult<()>>;

    /// Insert a record only if the username is free. Returns `false` if taken.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn insert_new(&self, record: &UserRecord) -> StoreFuture<'_, RelayResult<bool>>;

    /// Delete a user record. Returns `false` if it did not exist.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete(&self, username: &str) -> StoreFuture<'_, RelayResult<bool>>;

    /// List all records ordered by creation.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list(&self) -> StoreFuture<'_, RelayResult<Vec<UserRecord>>>;

    /// Number of stored accounts.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn count(&self) -> StoreFuture<'_, RelayResult<u64>>;
}

/// `SQLite` implementation of the user store.
pub struct SqliteUserStore {
    conn: Connection,
    table: String,
}

impl SqliteUserStore {
    /// Open the database at the configured path and create the table.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn new(config: &StorageConfig) -> RelayResult<Self> {
        let conn = Connection::open(&config.sqlite_path).await?;
        Self::with_connection(conn, &config.user_table).await
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub async fn in_memory() -> RelayResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, &StorageConfig::default().user_table).await
    }

    async fn with_connection(conn: Connection, table: &str) -> RelayResult<Self> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RelayError::Config(format!("invalid table name: {table}")));
        }
        let table = table.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    username TEXT PRIMARY KEY,
                    role TEXT NOT NULL,
                    record_json TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }
}

impl UserStore for SqliteUserStore {
    fn get(&self, username: &str) -> StoreFuture<'_, RelayResult<Option<UserRecord>>> {
        let username = username.to_string();
        Box::pin(async move {
            let table = self.table.clone();

            let json = self
                .conn
                .call(move |conn| {
                    let json: Option<String> = conn
                        .query_row(
                            &format!("SELECT record_json FROM {table} WHERE username = ?1"),
                            rusqlite::params![username],
                            |row| row.get(0),
                        )
                        .optional()?;
                    Ok(json)
                })
                .await?;

            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn save(&self, record: &UserRecord) -> StoreFuture<'_, RelayResult<()>> {
        let record = record.clone();
        Box::pin(async move {
            let table = self.table.clone();
            let record_json = serde_json::to_string(&record)?;
            let role = record.role.to_string();
            let now = chrono::Utc::now().timestamp_millis();

            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {table} (username, role, record_json, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?4)
                             ON CONFLICT(username) DO UPDATE SET
                                role = excluded.role,
                                record_json = excluded.record_json,
                                updated_at = excluded.updated_at"
                        ),
                        rusqlite::params![record.username, role, record_json, now],
                    )?;
                    Ok(())
                })
                .await?;

            Ok(())
        })
    }

    fn insert_new(&self, record: &UserRecord) -> StoreFuture<'_, RelayResult<bool>> {
        let record = record.clone();
        Box::pin(async move {
            let table = self.table.clone();
            let record_json = serde_json::to_string(&record)?;
            let role = record.role.to_string();
            let now = chrono::Utc::now().timestamp_millis();

            let inserted = self
                .conn
                .call(move |conn| {
                    let changed = conn.execute(
                        &format!(
                            "INSERT OR IGNORE INTO {table} (username, role, record_json, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?4)"
                        ),
                        rusqlite::params![record.username, role, record_json, now],
                    )?;
                    Ok(changed > 0)
                })
                .await?;

            Ok(inserted)
        })
    }

    fn delete(&self, username: &str) -> StoreFuture<'_, RelayResult<bool>> {
        let username = username.to_string();
        Box::pin(async move {
            let table = self.table.clone();

            let deleted = self
                .conn
                .call(move |conn| {
                    let changed = conn.execute(
                        &format!("DELETE FROM {table} WHERE username = ?1"),
                        rusqlite::params![username],
                    )?;
                    Ok(changed > 0)
                })
                .await?;

            Ok(deleted)
        })
    }

    fn list(&self) -> StoreFuture<'_, RelayResult<Vec<UserRecord>>> {
        Box::pin(async move {
            let table = self.table.clone();

            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT record_json FROM {table} ORDER BY created_at, username"
                    ))?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;

            let mut records = Vec::with_capacity(rows.len());
            for json in rows {
                records.push(serde_json::from_str(&json)?);
            }
            Ok(records)
        })
    }

    fn count(&self) -> StoreFuture<'_, RelayResult<u64>> {
        Box::pin(async move {
            let table = self.table.clone();

            let count = self
                .conn
                .call(move |conn| {
                    let count: i64 = conn.query_row(
                        &format!("SELECT COUNT(*) FROM {table}"),
                        [],
                        |row| row.get(0),
                    )?;
                    Ok(count)
                })
                .await?;

            u64::try_from(count)
                .map_err(|_| RelayError::Config("negative row count".to_string()))
        })
    }
}
