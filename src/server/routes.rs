//! HTTP route handlers for the chat relay.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::header::SET_COOKIE;
use axum::http::request::Parts;
use axum::response::{AppendHeaders, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::debug;

use crate::accounts::UserOverview;
use crate::auth::session::{Session, session_cookie};
use crate::conversation::manager::{Attachment, ConversationSummary};
use crate::error::{RelayError, RelayResult};
use crate::ids::SessionToken;
use crate::store::records::{Turn, UserRecord, UserRole};

use super::state::AppState;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let static_dir = ServeDir::new(&state.config.server.static_dir);
    Router::new()
        .route("/health", get(health_check))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{index}", get(select_conversation))
        .route("/api/new_chat", post(new_chat))
        .route("/api/chat", post(chat))
        .route("/api/reset_history", post(reset_history))
        .route("/api/models", get(list_models))
        .route("/api/admin/users", get(admin_users))
        .route("/api/admin/delete/{username}", post(admin_delete))
        .route("/api/admin/export", get(admin_export))
        .fallback_service(static_dir)
        .with_state(state)
}

/// Session resolved from the request's token header or cookie.
pub struct AuthSession(pub Arc<Session>);

impl FromRequestParts<Arc<AppState>> for AuthSession {
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        state.gate.resolve_headers(&parts.headers).map(Self)
    }
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Registration request.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Desired account name.
    #[serde(default)]
    pub username: String,
    /// Password.
    #[serde(default)]
    pub password: String,
    /// Password repeated.
    #[serde(default)]
    pub confirm: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> RelayResult<impl IntoResponse> {
    let username = state
        .accounts
        .register(&request.username, &request.password, &request.confirm)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "username": username }))))
}

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Account name.
    #[serde(default)]
    pub username: String,
    /// Password.
    #[serde(default)]
    pub password: String,
}

/// Login response.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Session token for the `x-session-token` header.
    pub token: SessionToken,
    /// Account name.
    pub username: String,
    /// Account role.
    pub role: UserRole,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> RelayResult<impl IntoResponse> {
    let session = state.accounts.login(&request.username, &request.password).await?;
    let body = LoginResponse {
        token: session.token,
        username: session.username.clone(),
        role: session.role,
    };
    Ok((AppendHeaders([(SET_COOKIE, session_cookie(session.token))]), Json(body)))
}

async fn logout(State(state): State<Arc<AppState>>, AuthSession(session): AuthSession) -> impl IntoResponse {
    state.accounts.logout(&session);
    Json(json!({ "status": "logged_out" }))
}

/// Conversation listing response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationsResponse {
    /// Summaries in storage order.
    pub conversations: Vec<ConversationSummary>,
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
) -> RelayResult<Json<ConversationsResponse>> {
    let conversations = state.conversations.list(&session.username).await?;
    Ok(Json(ConversationsResponse { conversations }))
}

/// Messages of a selected conversation.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Full transcript.
    pub messages: Vec<Turn>,
}

async fn select_conversation(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
    Path(index): Path<String>,
) -> RelayResult<Json<MessagesResponse>> {
    let index: i64 = index
        .parse()
        .map_err(|_| RelayError::NotFound("Invalid conversation index".to_string()))?;
    let messages = state.conversations.select(&session, index).await?;
    Ok(Json(MessagesResponse { messages }))
}

async fn new_chat(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
) -> RelayResult<impl IntoResponse> {
    let id = state.conversations.create(&session).await?;
    Ok(Json(json!({ "id": id })))
}

/// Chat request.
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    /// User message text.
    #[serde(default)]
    pub message: String,
    /// Attached files.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
}

/// Chat response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant reply, or the upstream failure description.
    pub message: String,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
    Json(request): Json<ChatRequest>,
) -> RelayResult<Json<ChatResponse>> {
    debug!(
        "chat turn for {} ({} attachments)",
        session.username,
        request.attachments.len()
    );
    let message = state
        .conversations
        .chat(&session, &request.message, &request.attachments, request.model.as_deref())
        .await?;
    Ok(Json(ChatResponse { message }))
}

async fn reset_history(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
) -> impl IntoResponse {
    state.conversations.reset(&session).await;
    Json(json!({ "status": "reset" }))
}

/// Model listing response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// Model identifiers.
    pub models: Vec<String>,
}

async fn list_models(State(state): State<Arc<AppState>>) -> RelayResult<Json<ModelsResponse>> {
    let models = state.completion.list_models().await?;
    Ok(Json(ModelsResponse { models }))
}

/// Admin user listing response.
#[derive(Debug, Serialize, Deserialize)]
pub struct UsersResponse {
    /// One row per account.
    pub users: Vec<UserOverview>,
}

async fn admin_users(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
) -> RelayResult<Json<UsersResponse>> {
    let users = state.accounts.list_users(&session).await?;
    Ok(Json(UsersResponse { users }))
}

async fn admin_delete(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
    Path(username): Path<String>,
) -> RelayResult<impl IntoResponse> {
    state.accounts.delete_user(&session, &username).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

async fn admin_export(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
) -> RelayResult<Json<Vec<UserRecord>>> {
    Ok(Json(state.accounts.export(&session).await?))
}
