//! Per-user conversations: titles, selection and chat turns.

pub mod manager;
pub mod title;

pub use manager::{
    Attachment, ConversationManager, ConversationSummary, SYSTEM_INSTRUCTION, append_turn,
    compose_user_content,
};
pub use title::{DEFAULT_TITLE, TITLE_MAX_CHARS, derive_title};
