//! Model client for the decision oracle using an OpenAI-compatible API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::oracle::DecisionOracle;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Default per-request HTTP timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
}

impl ModelError {
    /// Check if an error is retryable (network errors, 5xx, 429).
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::RequestFailed(_) => true,
            ModelError::ApiError { status, message } => {
                *status == 429
                    || (500..600).contains(status)
                    || message.to_lowercase().contains("rate limit")
            }
            ModelError::ParseError(_) => false,
            ModelError::MaxRetriesExceeded(_, _) => false,
        }
    }
}

/// Configuration for the AI model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub extra_body: HashMap<String, Value>,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
    /// HTTP timeout for a single attempt in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.0,
            extra_body: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ModelConfig {
    /// Create a new ModelConfig with custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new ModelConfig with custom API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Create a new ModelConfig with custom model name.
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }

    /// Set the HTTP timeout for one attempt.
    pub fn with_request_timeout(mut self, timeout_secs: u64) -> Self {
        self.request_timeout_secs = timeout_secs;
        self
    }
}

/// Response from the AI model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub thinking: String,
    pub action: String,
    pub raw_content: String,
}

impl ModelResponse {
    /// Build a response from raw assistant text.
    pub fn from_content(raw_content: impl Into<String>) -> Self {
        let raw_content = raw_content.into();
        let (thinking, action) = parse_response(&raw_content);
        Self {
            thinking,
            action,
            raw_content,
        }
    }
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Client for interacting with OpenAI-compatible vision-language models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    /// Create a new ModelClient with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ModelConfig::default())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Send a request to the model.
    ///
    /// # Arguments
    /// * `messages` - List of message dictionaries in OpenAI format.
    ///
    /// # Returns
    /// ModelResponse containing thinking and action text.
    pub async fn request(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut body = json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
        });

        // Merge extra_body
        if let Value::Object(ref mut map) = body {
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        let mut last_error: Option<ModelError> = None;
        let max_attempts = self.config.max_retries + 1; // +1 for the initial attempt

        for attempt in 1..=max_attempts {
            match self.send_request(&url, &body).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        warn!(
                            attempt,
                            max_attempts,
                            retry_delay_secs = self.config.retry_delay_secs,
                            error = %e,
                            "Model request failed, retrying"
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        // All retries exhausted
        Err(ModelError::MaxRetriesExceeded(
            max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Send a single request to the API.
    async fn send_request(&self, url: &str, body: &Value) -> Result<ModelResponse, ModelError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::ParseError("No choices in response".to_string()))?
            .message
            .content
            .unwrap_or_default();
        debug!(chars = content.len(), "Model responded");

        Ok(ModelResponse::from_content(content))
    }
}

#[async_trait]
impl DecisionOracle for ModelClient {
    async fn query(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
        self.request(messages).await
    }
}

/// Split model output into thinking and action parts.
///
/// Understands `<think>`/`<answer>` tags; without them the whole text is the action.
pub fn parse_response(content: &str) -> (String, String) {
    if !content.contains("<answer>") {
        return (String::new(), content.trim().to_string());
    }

    let mut parts = content.splitn(2, "<answer>");
    let thinking = parts
        .next()
        .unwrap_or_default()
        .replace("<think>", "")
        .replace("</think>", "")
        .trim()
        .to_string();
    let action = parts
        .next()
        .map(|s| s.replace("</answer>", "").trim().to_string())
        .unwrap_or_default();

    (thinking, action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_default() {
        let config = ModelConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000/v1");
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        let config = config.with_model_name("m").with_max_retries(0);
        assert_eq!(config.model_name, "m");
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_parse_response() {
        let content = "<think>I need to tap the button</think><answer>{\"action\":\"tap\",\"x\":1,\"y\":2}</answer>";
        let (thinking, action) = parse_response(content);
        assert_eq!(thinking, "I need to tap the button");
        assert_eq!(action, "{\"action\":\"tap\",\"x\":1,\"y\":2}");
    }

    #[test]
    fn test_parse_response_no_answer() {
        let response = ModelResponse::from_content("  some raw content ");
        assert_eq!(response.thinking, "");
        assert_eq!(response.action, "some raw content");
    }

    #[test]
    fn test_retryable_classification() {
        let server = ModelError::ApiError {
            status: 503,
            message: "unavailable".to_string(),
        };
        let limited = ModelError::ApiError {
            status: 429,
            message: String::new(),
        };
        let bad_request = ModelError::ApiError {
            status: 400,
            message: "bad".to_string(),
        };
        assert!(server.is_retryable());
        assert!(limited.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!ModelError::ParseError("x".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_exhausts_retries() {
        let client = ModelClient::new(
            ModelConfig::default()
                .with_base_url("http://127.0.0.1:9")
                .with_max_retries(1)
                .with_retry_delay(0)
                .with_request_timeout(2),
        );
        let err = client.request(&[]).await.unwrap_err();
        assert!(matches!(err, ModelError::MaxRetriesExceeded(2, _)));
    }
}
