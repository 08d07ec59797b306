//! Client for an OpenAI-compatible completion service with an Ollama fallback.
//!
//! Behaviour:
//! - Chat turns go to `POST /v1/chat/completions`; any failure retries once on
//!   the legacy `POST /api/chat` with the same body.
//! - If both calls fail the reply is an error string that embeds both causes.
//!   Callers persist it like any other assistant turn.
//! - Model listing tries `GET /v1/models`, then `GET /models`, and surfaces a
//!   hard error if neither yields a usable shape.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};
use crate::store::records::Turn;

/// Primary chat path (OpenAI style).
const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
/// Legacy chat path (older Ollama).
const LEGACY_CHAT_PATH: &str = "/api/chat";
/// Primary model listing path.
const MODELS_PATH: &str = "/v1/models";
/// Secondary model listing path.
const LEGACY_MODELS_PATH: &str = "/models";

/// Reply used when the legacy endpoint answers without any content.
pub const NO_CONTENT_PLACEHOLDER: &str = "No content received from the LLM service.";

/// Boxed future type for completion operations.
pub type CompletionFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait abstraction over the completion service.
pub trait CompletionBackend: Send + Sync {
    /// Produce the assistant reply for a transcript.
    ///
    /// Never fails: upstream errors are rendered into the returned text.
    fn complete<'a>(&'a self, transcript: &'a [Turn], model: &'a str) -> CompletionFuture<'a, String>;

    /// List model identifiers offered upstream.
    ///
    /// # Errors
    /// Returns `ListingFailed` if both listing paths fail.
    fn list_models(&self) -> CompletionFuture<'_, RelayResult<Vec<String>>>;
}

/// Failure of a single upstream call.
#[derive(Debug)]
pub enum CompletionError {
    /// Network or transport failure.
    Transport(reqwest::Error),
    /// Upstream answered with a non-success status.
    Status(u16),
    /// Body was not JSON or lacked the expected fields.
    Malformed(String),
    /// Both the primary and the legacy call failed.
    UpstreamUnavailable {
        /// Failure of the primary call.
        primary: Box<CompletionError>,
        /// Failure of the legacy call.
        legacy: Box<CompletionError>,
    },
}

impl From<reqwest::Error> for CompletionError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value)
    }
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::Status(status) => write!(f, "upstream returned HTTP {status}"),
            Self::Malformed(detail) => write!(f, "malformed upstream response: {detail}"),
            Self::UpstreamUnavailable { primary, legacy } => {
                write!(f, "Error contacting LLM service: {legacy}\n(initial error: {primary})")
            }
        }
    }
}

impl std::error::Error for CompletionError {}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    stream: bool,
}

/// HTTP client for the completion service.
pub struct CompletionClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    listing_timeout: Duration,
    completion_timeout: Duration,
}

impl CompletionClient {
    /// Build a client from upstream settings.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &UpstreamConfig) -> RelayResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(RelayError::HttpClient)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            listing_timeout: config.listing_timeout,
            completion_timeout: config.completion_timeout,
        })
    }

    /// Send the transcript upstream, falling back to the legacy endpoint.
    ///
    /// # Errors
    /// Returns `UpstreamUnavailable` carrying both causes if both calls fail.
    pub async fn try_complete(&self, transcript: &[Turn], model: &str) -> Result<String, CompletionError> {
        let request = ChatRequest {
            model,
            messages: transcript,
            stream: false,
        };

        let primary = match self.post_chat(CHAT_COMPLETIONS_PATH, &request).await {
            Ok(body) => match extract_completion_content(&body) {
                Some(content) => return Ok(content),
                None => CompletionError::Malformed("missing choices[0].message.content".to_string()),
            },
            Err(err) => err,
        };
        warn!("primary completion failed, trying legacy endpoint: {primary}");

        let legacy = match self.post_chat(LEGACY_CHAT_PATH, &request).await {
            Ok(body) if body.is_object() => {
                return Ok(extract_legacy_content(&body)
                    .unwrap_or_else(|| NO_CONTENT_PLACEHOLDER.to_string()));
            }
            Ok(_) => CompletionError::Malformed("legacy reply is not a JSON object".to_string()),
            Err(err) => err,
        };

        Err(CompletionError::UpstreamUnavailable {
            primary: Box::new(primary),
            legacy: Box::new(legacy),
        })
    }

    /// Query both listing paths and collect model identifiers.
    ///
    /// # Errors
    /// Returns `ListingFailed` with the last cause if both paths fail.
    pub async fn fetch_models(&self) -> RelayResult<Vec<String>> {
        let primary = match self.get_models(MODELS_PATH).await {
            Ok(models) => return Ok(models),
            Err(err) => err,
        };
        debug!("model listing on {MODELS_PATH} failed: {primary}");

        self.get_models(LEGACY_MODELS_PATH)
            .await
            .map_err(|err| RelayError::ListingFailed(err.to_string()))
    }

    async fn post_chat(&self, path: &str, request: &ChatRequest<'_>) -> Result<Value, CompletionError> {
        let url = format!("{}{path}", self.base_url);
        let builder = self
            .client
            .post(&url)
            .timeout(self.completion_timeout)
            .json(request);
        self.send_json(builder).await
    }

    async fn get_models(&self, path: &str) -> Result<Vec<String>, CompletionError> {
        let url = format!("{}{path}", self.base_url);
        let builder = self.client.get(&url).timeout(self.listing_timeout);
        let body = self.send_json(builder).await?;
        extract_model_ids(&body)
            .ok_or_else(|| CompletionError::Malformed("unrecognized model listing".to_string()))
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value, CompletionError> {
        let builder = match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CompletionError::Status(status.as_u16()));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|err| CompletionError::Malformed(err.to_string()))
    }
}

impl CompletionBackend for CompletionClient {
    fn complete<'a>(&'a self, transcript: &'a [Turn], model: &'a str) -> CompletionFuture<'a, String> {
        Box::pin(async move {
            match self.try_complete(transcript, model).await {
                Ok(content) => content,
                Err(err) => {
                    warn!("completion service unavailable: {err}");
                    err.to_string()
                }
            }
        })
    }

    fn list_models(&self) -> CompletionFuture<'_, RelayResult<Vec<String>>> {
        Box::pin(self.fetch_models())
    }
}

/// `choices[0].message.content` as a string.
fn extract_completion_content(body: &Value) -> Option<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Legacy replies: a flat `message` string, Ollama's `message.content`, or the completions shape.
fn extract_legacy_content(body: &Value) -> Option<String> {
    let content = match body.get("message") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(message @ Value::Object(_)) => message
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };

    content
        .filter(|text| !text.is_empty())
        .or_else(|| extract_completion_content(body).filter(|text| !text.is_empty()))
}

/// Model ids from `{data:[{id|name}]}` or a bare array.
fn extract_model_ids(body: &Value) -> Option<Vec<String>> {
    let entries = match body {
        Value::Object(map) => map.get("data")?.as_array()?,
        Value::Array(items) => items,
        _ => return None,
    };

    Some(
        entries
            .iter()
            .filter_map(|entry| match entry {
                Value::String(id) => Some(id.clone()),
                Value::Object(model) => model
                    .get("id")
                    .and_then(Value::as_str)
                    .or_else(|| model.get("name").and_then(Value::as_str))
                    .filter(|id| !id.is_empty())
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client_for(base_url: &str, api_key: Option<&str>) -> CompletionClient {
        let config = UpstreamConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(str::to_string),
            ..UpstreamConfig::default()
        };
        CompletionClient::new(&config).unwrap()
    }

    /// An address nothing listens on.
    async fn dead_base_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[test]
    fn test_extract_completion_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(extract_completion_content(&body).as_deref(), Some("hi"));
        assert_eq!(extract_completion_content(&json!({"choices": []})), None);
    }

    #[test]
    fn test_extract_legacy_shapes() {
        assert_eq!(
            extract_legacy_content(&json!({"message": "flat"})).as_deref(),
            Some("flat")
        );
        assert_eq!(
            extract_legacy_content(&json!({"message": {"role": "assistant", "content": "ollama"}}))
                .as_deref(),
            Some("ollama")
        );
        assert_eq!(
            extract_legacy_content(&json!({"choices": [{"message": {"content": "openai"}}]}))
                .as_deref(),
            Some("openai")
        );
        assert_eq!(extract_legacy_content(&json!({"done": true})), None);
    }

    #[test]
    fn test_extract_model_ids_shapes() {
        let data = json!({"data": [{"id": "a"}, {"name": "b"}, {"object": "model"}]});
        assert_eq!(extract_model_ids(&data), Some(vec!["a".to_string(), "b".to_string()]));

        let bare = json!(["x", {"id": "y"}]);
        assert_eq!(extract_model_ids(&bare), Some(vec!["x".to_string(), "y".to_string()]));

        assert_eq!(extract_model_ids(&json!({"models": []})), None);
    }

    #[test]
    fn test_unavailable_message_embeds_both_errors() {
        let err = CompletionError::UpstreamUnavailable {
            primary: Box::new(CompletionError::Status(502)),
            legacy: Box::new(CompletionError::Status(404)),
        };
        let text = err.to_string();
        assert!(text.starts_with("Error contacting LLM service: upstream returned HTTP 404"));
        assert!(text.contains("(initial error: upstream returned HTTP 502)"));
    }

    #[tokio::test]
    async fn test_primary_success_sends_full_transcript() {
        let router = Router::new().route(
            CHAT_COMPLETIONS_PATH,
            post(|Json(body): Json<Value>| async move {
                let count = body["messages"].as_array().map_or(0, Vec::len);
                assert_eq!(body["stream"], json!(false));
                Json(json!({
                    "choices": [{"message": {"content": format!("{} turns for {}", count, body["model"].as_str().unwrap_or_default())}}]
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let client = client_for(&base, None);

        let transcript = vec![Turn::system("s"), Turn::user("hello")];
        let reply = client.complete(&transcript, "m1").await;
        assert_eq!(reply, "2 turns for m1");
    }

    #[tokio::test]
    async fn test_falls_back_to_legacy_on_error_status() {
        let router = Router::new()
            .route(
                CHAT_COMPLETIONS_PATH,
                post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            )
            .route(
                LEGACY_CHAT_PATH,
                post(|| async { Json(json!({"message": {"role": "assistant", "content": "legacy"}})) }),
            );
        let base = spawn_upstream(router).await;
        let client = client_for(&base, None);

        let reply = client.complete(&[Turn::user("hi")], "m").await;
        assert_eq!(reply, "legacy");
    }

    #[tokio::test]
    async fn test_falls_back_on_malformed_primary_body() {
        let router = Router::new()
            .route(CHAT_COMPLETIONS_PATH, post(|| async { "not json" }))
            .route(LEGACY_CHAT_PATH, post(|| async { Json(json!({"done": true})) }));
        let base = spawn_upstream(router).await;
        let client = client_for(&base, None);

        let reply = client.complete(&[Turn::user("hi")], "m").await;
        assert_eq!(reply, NO_CONTENT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_non_object_legacy_body_is_an_error() {
        let router = Router::new()
            .route(CHAT_COMPLETIONS_PATH, post(|| async { StatusCode::BAD_GATEWAY }))
            .route(LEGACY_CHAT_PATH, post(|| async { Json(json!([])) }));
        let base = spawn_upstream(router).await;
        let client = client_for(&base, None);

        let reply = client.complete(&[Turn::user("hi")], "m").await;
        assert!(reply.starts_with("Error contacting LLM service: malformed upstream response"));
        assert!(reply.contains("(initial error: upstream returned HTTP 502)"));
    }

    #[tokio::test]
    async fn test_both_endpoints_fail_yields_error_text() {
        let client = client_for(&dead_base_url().await, None);

        let reply = client.complete(&[Turn::user("hi")], "m").await;
        assert!(reply.starts_with("Error contacting LLM service:"));
        assert!(reply.contains("(initial error:"));
    }

    #[tokio::test]
    async fn test_bearer_header_only_when_configured() {
        let router = Router::new().route(
            CHAT_COMPLETIONS_PATH,
            post(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                Json(json!({"choices": [{"message": {"content": auth}}]}))
            }),
        );
        let base = spawn_upstream(router).await;

        let with_key = client_for(&base, Some("sk-test"));
        assert_eq!(with_key.complete(&[Turn::user("x")], "m").await, "Bearer sk-test");

        let without_key = client_for(&base, None);
        assert_eq!(without_key.complete(&[Turn::user("x")], "m").await, "none");
    }

    #[tokio::test]
    async fn test_list_models_falls_back_to_secondary_path() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new()
            .route(MODELS_PATH, get(|| async { Json(json!({"unexpected": true})) }))
            .route(
                LEGACY_MODELS_PATH,
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Json(json!(["llama3", "qwen"])) }
                }),
            );
        let base = spawn_upstream(router).await;
        let client = client_for(&format!("{base}/"), None);

        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3".to_string(), "qwen".to_string()]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_models_total_failure_is_hard_error() {
        let client = client_for(&dead_base_url().await, None);
        assert!(matches!(
            client.list_models().await,
            Err(RelayError::ListingFailed(_))
        ));
    }
}
