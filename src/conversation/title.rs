//! Conversation titles for the sidebar listing.

use crate::store::records::{Conversation, Role};

/// Title used before the first user turn exists.
pub const DEFAULT_TITLE: &str = "New conversation";
/// Maximum title length in characters.
pub const TITLE_MAX_CHARS: usize = 50;

/// Derive a title from the first line of the first user turn.
#[must_use]
pub fn derive_title(index: usize, conversation: &Conversation) -> String {
    let Some(first_user) = conversation.messages.iter().find(|t| t.role == Role::User) else {
        return DEFAULT_TITLE.to_string();
    };

    let first_line = first_user.content.split('\n').next().unwrap_or_default();
    let title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if title.is_empty() {
        format!("Conversation {}", index + 1)
    } else {
        title
    }
}
