//! Conversation lifecycle: list, select, create, chat and reset.
//!
//! Lock order is always session state first, then the user lock. A chat turn
//! holds its session lock across the upstream call, but takes the user lock
//! only around the final load-modify-save.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::session::{Session, SessionState};
use crate::conversation::title::derive_title;
use crate::error::{RelayError, RelayResult};
use crate::llm::CompletionBackend;
use crate::store::locks::UserLocks;
use crate::store::records::{Turn, UserRecord};
use crate::store::user_store::UserStore;

/// Instruction injected before the first user turn of every transcript.
pub const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Always reply in the language the user writes in, \
and do not add translations into other languages unless the user explicitly asks for them.";

/// Entry of the conversation listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Position in the user's conversation list.
    pub id: usize,
    /// Display title.
    pub title: String,
}

/// File reference attached to a chat message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Attachment {
    /// File name shown to the model.
    pub name: String,
    /// Inline payload; not forwarded upstream.
    #[serde(default)]
    pub data: Option<String>,
}

/// Append a turn, injecting the system instruction into an empty transcript.
pub fn append_turn(state: &mut SessionState, turn: Turn) {
    if state.transcript.is_empty() {
        state.transcript.push(Turn::system(SYSTEM_INSTRUCTION));
    }
    state.transcript.push(turn);
}

/// Build the user turn content: trimmed message plus one line per attachment.
#[must_use]
pub fn compose_user_content(message: &str, attachments: &[Attachment]) -> String {
    let mut content = message.trim().to_string();
    for attachment in attachments {
        content.push_str(&format!("\n[attachment: {}]", attachment.name));
    }
    content
}

/// Coordinates session transcripts, the user store and the completion service.
pub struct ConversationManager {
    store: Arc<dyn UserStore>,
    locks: Arc<UserLocks>,
    completion: Arc<dyn CompletionBackend>,
    default_model: String,
}

impl ConversationManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn UserStore>,
        locks: Arc<UserLocks>,
        completion: Arc<dyn CompletionBackend>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            locks,
            completion,
            default_model: default_model.into(),
        }
    }

    /// Model used when a request does not name one.
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Summaries of a user's conversations in storage order.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown user, or a storage error.
    pub async fn list(&self, username: &str) -> RelayResult<Vec<ConversationSummary>> {
        let user = self.require_user(username).await?;
        Ok(user
            .conversations
            .iter()
            .enumerate()
            .map(|(id, conversation)| ConversationSummary {
                id,
                title: derive_title(id, conversation),
            })
            .collect())
    }

    /// Load a stored conversation into the session's transcript.
    ///
    /// Out-of-range indices leave the transcript untouched.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown user or invalid index.
    pub async fn select(&self, session: &Session, index: i64) -> RelayResult<Vec<Turn>> {
        let mut state = session.state.lock().await;
        let user = self.require_user(&session.username).await?;

        let conversation = usize::try_from(index)
            .ok()
            .and_then(|i| user.conversations.get(i))
            .ok_or_else(|| RelayError::NotFound("Invalid conversation index".to_string()))?;

        state.transcript.clone_from(&conversation.messages);
        state.current_conversation = Some(conversation.id);
        debug!("{} selected conversation {index}", session.username);
        Ok(conversation.messages.clone())
    }

    /// Start a new empty conversation and point the session at it.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown user, or a storage error.
    pub async fn create(&self, session: &Session) -> RelayResult<usize> {
        let mut state = session.state.lock().await;

        let (index, id) = {
            let _guard = self.locks.lock(&session.username).await;
            let mut user = self.require_user(&session.username).await?;
            let allocated = user.push_conversation();
            self.store.save(&user).await?;
            allocated
        };

        state.transcript.clear();
        state.current_conversation = Some(id);
        info!("{} created conversation {index}", session.username);
        Ok(index)
    }

    /// Run one chat turn and persist the resulting transcript.
    ///
    /// Upstream failures do not fail the turn; their description becomes the
    /// assistant reply.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for empty content, `NotFound` for an unknown
    /// user, or a storage error. On error the transcript is left as it was.
    pub async fn chat(
        &self,
        session: &Session,
        message: &str,
        attachments: &[Attachment],
        model: Option<&str>,
    ) -> RelayResult<String> {
        let content = compose_user_content(message, attachments);
        if content.is_empty() {
            return Err(RelayError::InvalidRequest("Message is empty".to_string()));
        }
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model);

        let mut state = session.state.lock().await;
        self.require_user(&session.username).await?;

        let snapshot_len = state.transcript.len();
        let snapshot_pointer = state.current_conversation;

        append_turn(&mut state, Turn::user(content));
        let reply = self.completion.complete(&state.transcript, model).await;
        append_turn(&mut state, Turn::assistant(reply.clone()));

        if let Err(err) = self.persist(&session.username, &mut state).await {
            state.transcript.truncate(snapshot_len);
            state.current_conversation = snapshot_pointer;
            return Err(err);
        }

        Ok(reply)
    }

    /// Clear the session transcript and detach it from its conversation.
    pub async fn reset(&self, session: &Session) {
        let mut state = session.state.lock().await;
        state.transcript.clear();
        state.current_conversation = None;
        debug!("{} reset working transcript", session.username);
    }

    /// Write the full transcript into the session's conversation.
    ///
    /// Allocates a conversation if the session has none, or if the one it
    /// points at no longer exists. Returns the conversation's index.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown user, or a storage error.
    pub async fn persist(&self, username: &str, state: &mut SessionState) -> RelayResult<usize> {
        let _guard = self.locks.lock(username).await;
        let mut user = self.require_user(username).await?;

        let index = match state.current_conversation.and_then(|id| user.position_of(id)) {
            Some(index) => index,
            None => {
                let (index, id) = user.push_conversation();
                state.current_conversation = Some(id);
                info!("{username} started conversation {index}");
                index
            }
        };

        user.conversations[index].messages.clone_from(&state.transcript);
        self.store.save(&user).await?;
        Ok(index)
    }

    async fn require_user(&self, username: &str) -> RelayResult<UserRecord> {
        self.store
            .get(username)
            .await?
            .ok_or_else(|| RelayError::NotFound("User not found".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::auth::session::SessionGate;
    use crate::config::UpstreamConfig;
    use crate::llm::{CompletionClient, CompletionFuture};
    use crate::store::records::{Role, UserRole};
    use crate::store::user_store::SqliteUserStore;

    /// Replies with a numbered echo of the last user turn.
    #[derive(Default)]
    struct EchoBackend {
        calls: AtomicUsize,
    }

    impl CompletionBackend for EchoBackend {
        fn complete<'a>(&'a self, transcript: &'a [Turn], model: &'a str) -> CompletionFuture<'a, String> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let last = transcript.last().map(|t| t.content.clone()).unwrap_or_default();
                format!("#{n} {model}: {last}")
            })
        }

        fn list_models(&self) -> CompletionFuture<'_, RelayResult<Vec<String>>> {
            Box::pin(async { Ok(vec!["echo".to_string()]) })
        }
    }

    struct Fixture {
        store: Arc<SqliteUserStore>,
        manager: ConversationManager,
        gate: SessionGate,
    }

    async fn fixture_with(completion: Arc<dyn CompletionBackend>) -> Fixture {
        let store = Arc::new(SqliteUserStore::in_memory().await.unwrap());
        store
            .save(&UserRecord::new("ana", "h", UserRole::User))
            .await
            .unwrap();
        let manager = ConversationManager::new(
            store.clone(),
            Arc::new(UserLocks::new()),
            completion,
            "default-model",
        );
        Fixture {
            store,
            manager,
            gate: SessionGate::new(),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(EchoBackend::default())).await
    }

    #[tokio::test]
    async fn test_message_count_after_n_turns() {
        for n in 1..=4 {
            let f = fixture().await;
            let session = f.gate.open("ana", UserRole::User);
            for i in 0..n {
                f.manager
                    .chat(&session, &format!("msg {i}"), &[], None)
                    .await
                    .unwrap();
            }
            let user = f.store.get("ana").await.unwrap().unwrap();
            assert_eq!(user.conversations.len(), 1);
            assert_eq!(user.conversations[0].messages.len(), 2 * n + 1);
            assert_eq!(user.conversations[0].messages[0].role, Role::System);
        }
    }

    #[tokio::test]
    async fn test_chat_uses_default_or_requested_model() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);

        let reply = f.manager.chat(&session, "  hi  ", &[], None).await.unwrap();
        assert_eq!(reply, "#1 default-model: hi");

        let reply = f.manager.chat(&session, "again", &[], Some("other")).await.unwrap();
        assert_eq!(reply, "#2 other: again");
    }

    #[tokio::test]
    async fn test_empty_message_rejected_without_side_effects() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);

        let err = f.manager.chat(&session, "   ", &[], None).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
        assert!(session.state.lock().await.transcript.is_empty());
        assert!(f.store.get("ana").await.unwrap().unwrap().conversations.is_empty());
    }

    #[tokio::test]
    async fn test_attachments_are_referenced_in_content() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);
        let attachments = vec![Attachment {
            name: "plan.pdf".to_string(),
            data: Some("data:application/pdf;base64,AA==".to_string()),
        }];

        f.manager.chat(&session, "", &attachments, None).await.unwrap();

        let user = f.store.get("ana").await.unwrap().unwrap();
        assert_eq!(user.conversations[0].messages[1].content, "\n[attachment: plan.pdf]");
    }

    #[tokio::test]
    async fn test_select_invalid_index_leaves_transcript() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);
        f.manager.chat(&session, "hello", &[], None).await.unwrap();
        let before = session.state.lock().await.clone();

        for index in [-1, 1, 99] {
            let err = f.manager.select(&session, index).await.unwrap_err();
            assert!(matches!(err, RelayError::NotFound(_)));
        }

        let after = session.state.lock().await.clone();
        assert_eq!(after.transcript, before.transcript);
        assert_eq!(after.current_conversation, before.current_conversation);
    }

    #[tokio::test]
    async fn test_select_then_continue_appends_to_that_conversation() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);
        f.manager.chat(&session, "first topic", &[], None).await.unwrap();
        f.manager.create(&session).await.unwrap();
        f.manager.chat(&session, "second topic", &[], None).await.unwrap();

        let messages = f.manager.select(&session, 0).await.unwrap();
        assert_eq!(messages.len(), 3);
        f.manager.chat(&session, "back to first", &[], None).await.unwrap();

        let user = f.store.get("ana").await.unwrap().unwrap();
        assert_eq!(user.conversations[0].messages.len(), 5);
        assert_eq!(user.conversations[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_create_twice_gives_consecutive_empty_conversations() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);

        assert_eq!(f.manager.create(&session).await.unwrap(), 0);
        assert_eq!(f.manager.create(&session).await.unwrap(), 1);

        assert!(f.manager.select(&session, 0).await.unwrap().is_empty());
        assert!(f.manager.select(&session, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_indices() {
        let f = Arc::new(fixture().await);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = Arc::clone(&f);
            let session = f.gate.open("ana", UserRole::User);
            handles.push(tokio::spawn(async move { f.manager.create(&session).await.unwrap() }));
        }

        let mut indices = Vec::new();
        for handle in handles {
            indices.push(handle.await.unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert_eq!(f.store.get("ana").await.unwrap().unwrap().conversations.len(), 8);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_content_bytes() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);
        let tricky = "línea 1\r\n\t\"quoted\" \\ 🚀\u{0}end";
        f.manager.chat(&session, tricky, &[], None).await.unwrap();
        let persisted = session.state.lock().await.transcript.clone();

        let other = f.gate.open("ana", UserRole::User);
        let loaded = f.manager.select(&other, 0).await.unwrap();

        assert_eq!(loaded, persisted);
        assert_eq!(loaded[1].content, tricky.trim());
    }

    #[tokio::test]
    async fn test_list_titles() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);
        f.manager.chat(&session, "Hello\nworld", &[], None).await.unwrap();
        f.manager.create(&session).await.unwrap();

        let summaries = f.manager.list("ana").await.unwrap();
        assert_eq!(
            summaries,
            vec![
                ConversationSummary { id: 0, title: "Hello".to_string() },
                ConversationSummary { id: 1, title: "New conversation".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let f = fixture().await;
        let ghost = f.gate.open("ghost", UserRole::User);

        assert!(matches!(f.manager.list("ghost").await, Err(RelayError::NotFound(_))));
        assert!(matches!(f.manager.create(&ghost).await, Err(RelayError::NotFound(_))));
        assert!(matches!(
            f.manager.chat(&ghost, "hi", &[], None).await,
            Err(RelayError::NotFound(_))
        ));
        assert!(ghost.state.lock().await.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_reset_starts_a_new_conversation() {
        let f = fixture().await;
        let session = f.gate.open("ana", UserRole::User);
        f.manager.chat(&session, "one", &[], None).await.unwrap();
        f.manager.reset(&session).await;
        f.manager.chat(&session, "two", &[], None).await.unwrap();

        let user = f.store.get("ana").await.unwrap().unwrap();
        assert_eq!(user.conversations.len(), 2);
        assert_eq!(user.conversations[0].messages.len(), 3);
        assert_eq!(user.conversations[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_transcripts() {
        let f = fixture().await;
        let first = f.gate.open("ana", UserRole::User);
        let second = f.gate.open("ana", UserRole::User);

        f.manager.chat(&first, "from first", &[], None).await.unwrap();
        f.manager.chat(&second, "from second", &[], None).await.unwrap();
        f.manager.chat(&first, "first again", &[], None).await.unwrap();

        let user = f.store.get("ana").await.unwrap().unwrap();
        assert_eq!(user.conversations.len(), 2);
        assert_eq!(user.conversations[0].messages.len(), 5);
        assert_eq!(user.conversations[1].messages.len(), 3);
        assert_eq!(user.conversations[1].messages[1].content, "from second");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_persisted_as_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = UpstreamConfig {
            base_url: format!("http://{addr}"),
            ..UpstreamConfig::default()
        };
        let client = Arc::new(CompletionClient::new(&config).unwrap());
        let f = fixture_with(client).await;
        let session = f.gate.open("ana", UserRole::User);

        let reply = f.manager.chat(&session, "hello", &[], None).await.unwrap();
        assert!(reply.starts_with("Error contacting LLM service:"));
        assert!(reply.contains("(initial error:"));

        let user = f.store.get("ana").await.unwrap().unwrap();
        let last = user.conversations[0].messages.last().unwrap();
        assert_eq!(last, &Turn::assistant(reply));
    }
}
