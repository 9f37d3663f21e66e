//! Chat-completion client for the investigation agent
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint and retries
//! transient failures with exponential backoff.

use crate::config::RetryConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Provider-level failures
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    #[error("authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed provider response: {message}")]
    InvalidResponse { message: String },
}

impl LlmError {
    /// Transient errors worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Connection { .. } | LlmError::Timeout { .. } => {
                true
            }
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::AuthFailed { .. } | LlmError::InvalidResponse { .. } => false,
        }
    }
}

impl From<LlmError> for PipelineError {
    fn from(err: LlmError) -> Self {
        PipelineError::UpstreamService(err.to_string())
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout {
                message: err.to_string(),
            }
        } else if err.is_decode() {
            LlmError::InvalidResponse {
                message: err.to_string(),
            }
        } else {
            LlmError::Connection {
                message: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One chat-completion call
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    /// Ask for `response_format: json_object`
    pub json_mode: bool,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// Wire body for the OpenAI chat-completions API
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": self.messages,
        });
        if self.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

/// Hosted chat model
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Assistant message content for the request
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

/// OpenAI-compatible chat-completions client
pub struct OpenAiChatClient {
    client: reqwest::Client,
    api_key: String,
    url: String,
}

impl OpenAiChatClient {
    pub fn new(api_key: impl Into<String>, endpoint: &str, timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::UpstreamService(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            url: resolve_chat_endpoint(endpoint),
        })
    }

    /// Build from the key in `api_key_env`; a missing or blank key fails fast
    pub fn from_env(api_key_env: &str, endpoint: &str, timeout: Duration) -> PipelineResult<Self> {
        let api_key = read_api_key(api_key_env)?;
        Self::new(api_key, endpoint, timeout)
    }
}

/// Read an API key from the environment
pub fn read_api_key(var: &str) -> PipelineResult<String> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(PipelineError::AuthConfiguration(format!(
            "{} is not set",
            var
        ))),
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request.to_body())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body, retry_after_secs));
        }

        let body = response.text().await?;
        let content = parse_chat_response(&body)?;
        debug!(model = %request.model, chars = content.len(), "Chat completion received");
        Ok(content)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

fn resolve_chat_endpoint(endpoint: &str) -> String {
    if endpoint.contains("/chat/completions") {
        endpoint.to_string()
    } else {
        format!("{}/chat/completions", endpoint.trim_end_matches('/'))
    }
}

fn classify_status(status: u16, body: &str, retry_after_secs: Option<u64>) -> LlmError {
    let message = truncate(body, 320);
    match status {
        401 | 403 => LlmError::AuthFailed { message },
        429 => LlmError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(1),
        },
        _ => LlmError::Api { status, message },
    }
}

/// First choice's message content
pub fn parse_chat_response(body: &str) -> Result<String, LlmError> {
    let parsed: OpenAiResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse {
            message: e.to_string(),
        })?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LlmError::InvalidResponse {
            message: "response has no message content".to_string(),
        })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// `on_retry` is called with the attempt number before each retry.
pub async fn with_retry<F, Fut, T, R>(config: &RetryConfig, operation: F, on_retry: R) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
    R: Fn(u32),
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_retryable() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                on_retry(attempt + 1);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff; rate limits wait for the server's retry-after.
/// Both are capped at `max_backoff_ms`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32, err: &LlmError) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let computed = base.min(config.max_backoff_ms as f64) as u64;
    match err {
        LlmError::RateLimited { retry_after_secs } => retry_after_secs
            .saturating_mul(1000)
            .max(computed)
            .min(config.max_backoff_ms),
        _ => computed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_request_body() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            json_mode: true,
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
        };
        let body = request.to_body();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");

        let text = ChatRequest {
            json_mode: false,
            ..request
        };
        assert!(text.to_body().get("response_format").is_none());
    }

    #[test]
    fn test_parse_chat_response() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Manual review advised."},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_chat_response(body).unwrap(), "Manual review advised.");

        assert!(matches!(
            parse_chat_response(r#"{"choices":[]}"#),
            Err(LlmError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_chat_response("<html>"),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_status(401, "", None), LlmError::AuthFailed { .. }));
        assert!(matches!(
            classify_status(429, "", Some(7)),
            LlmError::RateLimited { retry_after_secs: 7 }
        ));
        assert!(classify_status(503, "busy", None).is_retryable());
        assert!(!classify_status(400, "bad", None).is_retryable());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = RetryConfig::default();
        let err = LlmError::Connection {
            message: "reset".to_string(),
        };
        assert_eq!(compute_backoff(&config, 0, &err), 500);
        assert_eq!(compute_backoff(&config, 1, &err), 1000);
        assert_eq!(compute_backoff(&config, 10, &err), 8000);

        let limited = LlmError::RateLimited {
            retry_after_secs: 3,
        };
        assert_eq!(compute_backoff(&config, 0, &limited), 3000);
    }

    #[test]
    fn test_retry_after_is_capped() {
        let config = RetryConfig::default();
        for retry_after_secs in [20, 86_400, u64::MAX / 100, u64::MAX] {
            let err = LlmError::RateLimited { retry_after_secs };
            assert_eq!(compute_backoff(&config, 0, &err), config.max_backoff_ms);
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let retries = AtomicU32::new(0);
        let counter = &calls;

        let result = with_retry(
            &fast_retry(),
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LlmError::Timeout {
                        message: "slow".to_string(),
                    })
                } else {
                    Ok("done")
                }
            },
            |_| {
                retries.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(
            &fast_retry(),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Connection {
                    message: "refused".to_string(),
                })
            },
            |_| {},
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_no_retry_on_auth_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(
            &fast_retry(),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::AuthFailed {
                    message: "bad key".to_string(),
                })
            },
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_api_key_fails_fast() {
        let result = OpenAiChatClient::from_env(
            "CLAIM_FRAUD_PIPELINE_TEST_UNSET_KEY",
            "https://api.openai.com/v1",
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(PipelineError::AuthConfiguration(_))));
    }

    #[test]
    fn test_llm_errors_surface_as_upstream() {
        let err: PipelineError = LlmError::RateLimited {
            retry_after_secs: 1,
        }
        .into();
        assert_eq!(err.kind(), "upstream_service");
    }

    #[test]
    fn test_resolve_chat_endpoint() {
        assert_eq!(
            resolve_chat_endpoint("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            resolve_chat_endpoint("http://localhost:8080/v1/chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }
}
