//! Persisted user and conversation records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::ConversationId;

/// Speaker role of a turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instruction injected before the first user turn.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

impl Role {
    /// Stable string form for storage and the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One message in a conversation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Speaker role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl Turn {
    /// Build a system turn.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Build a user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Build an assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A stored conversation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable identifier; assigned on load for legacy records that lack one.
    #[serde(default)]
    pub id: ConversationId,
    /// Ordered turns.
    #[serde(default)]
    pub messages: Vec<Turn>,
}

impl Conversation {
    /// Create an empty conversation with a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Account role.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Regular account.
    #[default]
    User,
    /// May list, export and delete accounts.
    Admin,
}

impl UserRole {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            _ => Err(value.to_string()),
        }
    }
}

/// A user account with its conversations.
///
/// The serialized shape matches one element of the legacy `users.json`
/// collection document.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Unique account name.
    pub username: String,
    /// Encoded password credential.
    #[serde(alias = "password_credential", default)]
    pub password_hash: String,
    /// Account role.
    #[serde(default)]
    pub role: UserRole,
    /// Conversations in creation order.
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

impl UserRecord {
    /// Create a record with no conversations.
    #[must_use]
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>, role: UserRole) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            role,
            conversations: Vec::new(),
        }
    }

    /// Position of a conversation by identifier.
    #[must_use]
    pub fn position_of(&self, id: ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    /// Append an empty conversation and return its index and identifier.
    pub fn push_conversation(&mut self) -> (usize, ConversationId) {
        let conversation = Conversation::new();
        let id = conversation.id;
        self.conversations.push(conversation);
        (self.conversations.len() - 1, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_record_without_ids_loads() {
        let json = r#"{
            "username": "ana",
            "password_hash": "pbkdf2:sha256:xyz",
            "role": "admin",
            "conversations": [{"messages": [{"role": "user", "content": "hola"}]}]
        }"#;
        let record: UserRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.role, UserRole::Admin);
        assert_eq!(record.conversations.len(), 1);
        assert_eq!(record.conversations[0].messages[0], Turn::user("hola"));
    }

    #[test]
    fn test_password_credential_alias() {
        let json = r#"{"username": "bo", "password_credential": "x"}"#;
        let record: UserRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.password_hash, "x");
        assert_eq!(record.role, UserRole::User);
        assert!(record.conversations.is_empty());
    }

    #[test]
    fn test_push_conversation_returns_last_index() {
        let mut record = UserRecord::new("c", "h", UserRole::User);
        let (first, first_id) = record.push_conversation();
        let (second, second_id) = record.push_conversation();
        assert_eq!((first, second), (0, 1));
        assert_eq!(record.position_of(second_id), Some(1));
        assert_eq!(record.position_of(first_id), Some(0));
    }

    #[test]
    fn test_turn_wire_shape() {
        let json = serde_json::to_value(Turn::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }
}
