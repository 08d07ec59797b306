//! Persistent storage for user accounts and their conversations.

pub mod collection;
pub mod locks;
pub mod records;
pub mod user_store;

pub use collection::{export_collection, import_collection};
pub use locks::UserLocks;
pub use records::{Conversation, Role, Turn, UserRecord, UserRole};
pub use user_store::{SqliteUserStore, StoreFuture, UserStore};
