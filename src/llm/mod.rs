//! Upstream language-model service access.

pub mod completion_client;

pub use completion_client::{
    CompletionBackend, CompletionClient, CompletionError, CompletionFuture, NO_CONTENT_PLACEHOLDER,
};
