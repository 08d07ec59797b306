//! Import and export of the single-document `users.json` collection.

use std::path::Path;

use tracing::{info, warn};

use crate::error::RelayResult;
use crate::store::records::UserRecord;
use crate::store::user_store::UserStore;

/// Import every record from a collection document into the store.
///
/// Usernames that already exist are left untouched. Returns the number of
/// records inserted.
///
/// # Errors
/// Returns an error if the file cannot be read or is not a JSON array of users.
pub async fn import_collection(store: &dyn UserStore, path: &Path) -> RelayResult<usize> {
    let raw = tokio::fs::read_to_string(path).await?;
    let records: Vec<UserRecord> = serde_json::from_str(&raw)?;

    let mut inserted = 0_usize;
    for record in &records {
        if record.username.trim().is_empty() {
            warn!("skipping collection entry without username");
            continue;
        }
        if store.insert_new(record).await? {
            inserted += 1;
        } else {
            warn!("skipping existing user {} during import", record.username);
        }
    }

    info!("imported {inserted} of {} users from {}", records.len(), path.display());
    Ok(inserted)
}

/// Export all records as one collection document.
///
/// # Errors
/// Returns an error if storage access fails.
pub async fn export_collection(store: &dyn UserStore) -> RelayResult<Vec<UserRecord>> {
    store.list().await
}
