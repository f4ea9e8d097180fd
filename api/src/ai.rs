use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Connect/total bounds for one provider call.
pub const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const API_TOTAL_TIMEOUT: Duration = Duration::from_secs(90);

/// Attempt cap across transport and provider-reported failures.
pub const MAX_RETRY_ATTEMPTS: u32 = 2;

const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(2);

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// One failed provider call. Transport problems and provider-reported API
/// errors are both retryable up to the attempt cap.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider api error: {0}")]
    Api(String),
}

/// Terminal pipeline error after the retry budget is spent.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI provider unavailable after {attempts} attempts: {last_error}")]
    ServiceUnavailable { attempts: u32, last_error: String },
}

/// A single chat-completion request, already assembled from level prompts.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub user_message: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(system: String, user_message: String) -> Self {
        Self {
            system,
            user_message,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// Seam for the chat-completion backend so tests can substitute an
/// in-memory provider. Injected through `AppState`, never a global.
pub trait ChatProvider: Send + Sync {
    fn complete(
        &self,
        request: &ChatRequest,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}

/// Provider endpoint configuration, read from the environment once at
/// startup.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("ESSAYLAB_AI_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string()),
            api_key: std::env::var("ESSAYLAB_AI_KEY").unwrap_or_default(),
            model: std::env::var("ESSAYLAB_AI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        }
    }
}

/// reqwest-backed provider speaking the chat-completion wire format:
/// request `{model, system, messages, max_tokens, temperature}`, response
/// either `{error: {...}}` or `{content: [{type: "text", text}, ...]}`.
pub struct HttpChatProvider {
    client: reqwest::Client,
    config: AiConfig,
}

impl HttpChatProvider {
    pub fn new(config: AiConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(API_CONNECT_TIMEOUT)
            .timeout(API_TOTAL_TIMEOUT)
            .build()
            .expect("reqwest client builds with static configuration");

        Self { client, config }
    }
}

impl ChatProvider for HttpChatProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let payload = json!({
            "model": self.config.model,
            "system": request.system,
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": request.user_message}],
            }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Transport(format!(
                "provider returned HTTP {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        parse_completion(&body)
    }
}

/// Decode one provider response body: surface the `error` field as an API
/// error, otherwise concatenate the text content parts. Malformed JSON is a
/// transport failure.
fn parse_completion(body: &str) -> Result<String, ProviderError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| ProviderError::Transport(format!("malformed provider JSON: {err}")))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ProviderError::Api(message));
    }

    let mut text = String::new();
    if let Some(parts) = value.get("content").and_then(|c| c.as_array()) {
        for part in parts {
            if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(fragment) = part.get("text").and_then(|t| t.as_str()) {
                    text.push_str(fragment);
                }
            }
        }
    }

    // Empty text is not retried here: content problems belong to the parse
    // stage, not the transport.
    Ok(text)
}

/// Backoff before the next attempt: linear in the attempt number.
pub fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BACKOFF_BASE * attempt
}

/// Call the provider with the bounded retry policy. Every failure mode is
/// retried up to `MAX_RETRY_ATTEMPTS`; exhaustion produces a typed
/// `ServiceUnavailable` the pipeline turns into a structured payload.
pub async fn complete_with_retry<P: ChatProvider>(
    provider: &P,
    request: &ChatRequest,
    operation: &str,
) -> Result<String, AiError> {
    let mut last_error = String::new();

    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        tracing::debug!(operation, attempt, max = MAX_RETRY_ATTEMPTS, "provider call");

        match provider.complete(request).await {
            Ok(text) => {
                tracing::info!(operation, attempt, "provider call succeeded");
                return Ok(text);
            }
            Err(err) => {
                tracing::warn!(operation, attempt, error = %err, "provider call failed");
                last_error = err.to_string();
                if attempt < MAX_RETRY_ATTEMPTS {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    Err(AiError::ServiceUnavailable {
        attempts: MAX_RETRY_ATTEMPTS,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::{
        AiError, ChatProvider, ChatRequest, MAX_RETRY_ATTEMPTS, ProviderError, backoff_delay,
        complete_with_retry, parse_completion,
    };

    struct FailingProvider {
        calls: AtomicU32,
    }

    impl ChatProvider for FailingProvider {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Transport("connection timed out".to_string()))
        }
    }

    struct FlakyProvider {
        calls: AtomicU32,
    }

    impl ChatProvider for FlakyProvider {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Err(ProviderError::Api("overloaded".to_string()))
            } else {
                Ok("Score: 70\nLooks better.".to_string())
            }
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("system".to_string(), "essay".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cap_is_exact() {
        let provider = FailingProvider {
            calls: AtomicU32::new(0),
        };

        let result = complete_with_retry(&provider, &request(), "test").await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS);
        match result {
            Err(AiError::ServiceUnavailable { attempts, .. }) => {
                assert_eq!(attempts, MAX_RETRY_ATTEMPTS);
            }
            Ok(_) => panic!("always-failing provider must not succeed"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn api_errors_are_retried_and_can_recover() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
        };

        let text = complete_with_retry(&provider, &request(), "test")
            .await
            .expect("second attempt succeeds");

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(text.contains("Score: 70"));
    }

    #[test]
    fn backoff_grows_with_attempt_number() {
        assert!(backoff_delay(2) > backoff_delay(1));
    }

    #[test]
    fn completion_parsing_concatenates_text_parts() {
        let body = r#"{"content": [
            {"type": "text", "text": "Part one. "},
            {"type": "tool_use", "id": "x"},
            {"type": "text", "text": "Part two."}
        ]}"#;
        assert_eq!(parse_completion(body).unwrap(), "Part one. Part two.");
    }

    #[test]
    fn completion_parsing_surfaces_error_field() {
        let body = r#"{"error": {"type": "rate_limit", "message": "slow down"}}"#;
        match parse_completion(body) {
            Err(ProviderError::Api(message)) => assert_eq!(message, "slow down"),
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_transport_failure() {
        match parse_completion("not json") {
            Err(ProviderError::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
