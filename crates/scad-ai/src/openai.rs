//! Client for OpenAI-compatible `chat/completions` endpoints.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{GenerationError, GenerationRequest, LanguageModel};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "o4-mini";
pub const DEFAULT_MAX_COMPLETION_TOKENS: u32 = 4500;
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub model: String,
    pub max_completion_tokens: u32,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_completion_tokens: DEFAULT_MAX_COMPLETION_TOKENS,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiChatModel {
    pub fn new(config: OpenAiConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, request: GenerationRequest<'_>) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: request.user_prompt,
                },
            ],
            max_completion_tokens: self.config.max_completion_tokens,
        };

        tracing::info!(model = %self.config.model, "requesting OpenSCAD script");
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(request.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|err| GenerationError::Transport {
                status: None,
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "text-generation request rejected");
            return Err(GenerationError::Transport {
                status: Some(status.as_u16()),
                message: truncate(text.trim(), ERROR_BODY_LIMIT),
            });
        }

        let payload: ChatResponse = response.json().await.map_err(|err| {
            GenerationError::EmptyOrMalformed(format!("unreadable completion payload: {err}"))
        })?;

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                GenerationError::EmptyOrMalformed("completion contained no message content".into())
            })
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::{OpenAiChatModel, OpenAiConfig, truncate};
    use crate::{ApiKey, GenerationError, GenerationRequest, LanguageModel};

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn spawn_mock(
        status: StatusCode,
        reply: Value,
    ) -> Option<(SocketAddr, Captured, JoinHandle<()>)> {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                eprintln!("skipping mock server test: local socket bind not permitted ({err})");
                return None;
            }
            Err(err) => panic!("listener should bind: {err}"),
        };
        let addr = listener.local_addr().expect("listener should expose address");
        let captured = Captured::default();

        let router = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    move |State(captured): State<Captured>,
                          headers: HeaderMap,
                          Json(body): Json<Value>| {
                        let reply = reply.clone();
                        async move {
                            let auth = headers
                                .get("authorization")
                                .and_then(|value| value.to_str().ok())
                                .map(str::to_string);
                            captured
                                .requests
                                .lock()
                                .expect("capture lock")
                                .push((auth, body));
                            (status, Json(reply))
                        }
                    },
                ),
            )
            .with_state(captured.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock server should run");
        });
        Some((addr, captured, handle))
    }

    fn model_for(addr: SocketAddr) -> OpenAiChatModel {
        OpenAiChatModel::new(OpenAiConfig {
            api_base: format!("http://{addr}/v1/"),
            timeout: Duration::from_secs(5),
            ..OpenAiConfig::default()
        })
        .expect("client should build")
    }

    fn request<'a>(key: &'a ApiKey) -> GenerationRequest<'a> {
        GenerationRequest {
            system_prompt: "system text",
            user_prompt: "a 10mm cube",
            api_key: key,
        }
    }

    #[tokio::test]
    async fn sends_chat_payload_and_returns_content() {
        let Some((addr, captured, server)) = spawn_mock(
            StatusCode::OK,
            json!({"choices": [{"message": {"role": "assistant", "content": "cube(10);"}}]}),
        )
        .await
        else {
            return;
        };

        let key = ApiKey::new("sk-live").expect("key");
        let text = model_for(addr)
            .complete(request(&key))
            .await
            .expect("completion should succeed");
        assert_eq!(text, "cube(10);");

        let requests = captured.requests.lock().expect("capture lock").clone();
        assert_eq!(requests.len(), 1);
        let (auth, body) = &requests[0];
        assert_eq!(auth.as_deref(), Some("Bearer sk-live"));
        assert_eq!(body["model"], "o4-mini");
        assert_eq!(body["max_completion_tokens"], 4500);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "system text");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "a 10mm cube");

        server.abort();
    }

    #[tokio::test]
    async fn non_success_status_is_transport_error() {
        let Some((addr, _captured, server)) = spawn_mock(
            StatusCode::UNAUTHORIZED,
            json!({"error": {"message": "Incorrect API key provided"}}),
        )
        .await
        else {
            return;
        };

        let key = ApiKey::new("sk-wrong").expect("key");
        let err = model_for(addr)
            .complete(request(&key))
            .await
            .expect_err("401 should fail");
        match err {
            GenerationError::Transport { status, message } => {
                assert_eq!(status, Some(401));
                assert!(message.contains("Incorrect API key"));
            }
            other => panic!("expected transport error, got {other:?}"),
        }

        server.abort();
    }

    #[tokio::test]
    async fn missing_choices_is_empty_or_malformed() {
        let Some((addr, _captured, server)) =
            spawn_mock(StatusCode::OK, json!({"choices": []})).await
        else {
            return;
        };

        let key = ApiKey::new("sk-live").expect("key");
        let err = model_for(addr)
            .complete(request(&key))
            .await
            .expect_err("no choices should fail");
        assert_eq!(err.kind(), "empty_or_malformed");

        server.abort();
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(_) => return,
        };
        let addr = listener.local_addr().expect("address");
        drop(listener);

        let key = ApiKey::new("sk-live").expect("key");
        let err = model_for(addr)
            .complete(request(&key))
            .await
            .expect_err("closed port should fail");
        assert!(matches!(err, GenerationError::Transport { status: None, .. }), "{err:?}");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("short", 10), "short");
    }
}
