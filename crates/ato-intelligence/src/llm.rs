//! LLM provider abstraction layer.
//!
//! A single async trait covers every backend the orchestrator can drive. The
//! orchestrator only ever needs one completed string per call, so there is no
//! streaming surface here.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ato_core::config::{CredentialProvider, ProviderKind, ProvidersConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    /// A remote provider was selected without its API key in the environment.
    #[error("missing credential: {0} is not set")]
    MissingCredential(String),

    /// The provider answered but produced no text.
    #[error("provider returned an empty completion")]
    EmptyResponse,

    #[error("request cancelled")]
    Cancelled,

    /// The local backend is already serving a request.
    #[error("a local model request is already running ({model}); retry when it finishes")]
    AlreadyRunning { model: String },
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::System => write!(f, "system"),
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }
}

/// Configuration for one completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl LlmConfig {
    pub fn from_providers(providers: &ProvidersConfig) -> Self {
        Self {
            model: providers.model.clone(),
            max_tokens: providers.max_tokens,
            temperature: providers.temperature,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider name used in diagnostics ("local", "anthropic", ...).
    fn name(&self) -> &str;

    /// Whether requests hit the resource-constrained local backend.
    fn is_local(&self) -> bool {
        false
    }

    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;

    /// Evict `model` from backend memory. Remote providers have nothing to do.
    async fn unload_model(&self, _model: &str) -> Result<(), LlmError> {
        Ok(())
    }

    /// Cheap reachability probe.
    async fn health_check(&self, _timeout: Duration) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Build the provider selected by `[providers].active`.
pub fn provider_from_config(cfg: &ProvidersConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    let provider: Arc<dyn LlmProvider> = match cfg.active {
        ProviderKind::Local => Arc::new(
            LocalProvider::new(&cfg.local_base_url, CredentialProvider::local_api_key())
                .with_timeout(timeout),
        ),
        ProviderKind::Anthropic => {
            let key = CredentialProvider::anthropic_api_key()
                .ok_or_else(|| LlmError::MissingCredential("ANTHROPIC_API_KEY".into()))?;
            Arc::new(AnthropicProvider::new(key).with_timeout(timeout))
        }
        ProviderKind::Openai => {
            let key = CredentialProvider::openai_api_key()
                .ok_or_else(|| LlmError::MissingCredential("OPENAI_API_KEY".into()))?;
            Arc::new(OpenAiProvider::new(key).with_timeout(timeout))
        }
    };
    Ok(provider)
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map 429 and other non-success statuses onto [`LlmError`].
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(LlmError::RateLimited {
            retry_after_secs: retry_after,
        });
    }
    if !resp.status().is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(LlmError::ApiError { status, message });
    }
    Ok(resp)
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// LLM provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// System prompt goes in the top-level `system` field, not in `messages`.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let mut system_text: Option<String> = config.system_prompt.clone();

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                if msg.role == LlmRole::System {
                    match system_text {
                        Some(ref mut s) => {
                            s.push('\n');
                            s.push_str(&msg.content);
                        }
                        None => system_text = Some(msg.content.clone()),
                    }
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role.to_string(),
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });
        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }
        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let api_resp: AnthropicResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions (OpenAI and local servers)
// ---------------------------------------------------------------------------

/// Build a `/v1/chat/completions` body; system prompts go inline.
pub fn chat_completions_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
    let mut api_messages: Vec<serde_json::Value> = Vec::new();
    if let Some(ref system) = config.system_prompt {
        api_messages.push(serde_json::json!({
            "role": "system",
            "content": system,
        }));
    }
    for msg in messages {
        api_messages.push(serde_json::json!({
            "role": msg.role.to_string(),
            "content": msg.content,
        }));
    }
    serde_json::json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
        "messages": api_messages,
    })
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl ChatCompletionResponse {
    fn into_response(self, requested_model: &str) -> Result<LlmResponse, LlmError> {
        let usage = self.usage;
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ParseError("no choices in response".into()))?;
        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            input_tokens: usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.as_ref().and_then(|u| u.completion_tokens).unwrap_or(0),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".into()),
        })
    }
}

/// LLM provider for the OpenAI Chat Completions API.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&chat_completions_body(messages, config))
            .send()
            .await?;

        let api_resp: ChatCompletionResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        api_resp.into_response(&config.model)
    }
}

// ---------------------------------------------------------------------------
// LocalProvider
// ---------------------------------------------------------------------------

/// Provider for a local inference server (Ollama, llama.cpp, vllm) speaking the
/// OpenAI-compatible chat endpoint.
///
/// The backend holds one model in GPU/RAM at a time; see
/// [`crate::runtime::RuntimeDiagnostics`] for the admission gate.
pub struct LocalProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl LocalProvider {
    /// `api_key` is optional; `None`, empty and `"none"` all mean no auth.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: http_client(Duration::from_secs(20 * 60)),
            api_key: api_key.filter(|k| !k.is_empty() && k != "none"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    fn connect_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_connect() {
            LlmError::HttpError(format!(
                "cannot connect to local inference server at {}: {}",
                self.base_url, e
            ))
        } else {
            LlmError::HttpError(e.to_string())
        }
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&chat_completions_body(messages, config));
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await.map_err(|e| self.connect_error(e))?;
        let api_resp: ChatCompletionResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        api_resp.into_response(&config.model)
    }

    /// Ollama drops a model from memory when asked to keep it alive for zero seconds.
    async fn unload_model(&self, model: &str) -> Result<(), LlmError> {
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&serde_json::json!({ "model": model, "keep_alive": 0 }))
            .send()
            .await
            .map_err(|e| self.connect_error(e))?;
        check_status(resp).await?;
        debug!(model, "local model unloaded");
        Ok(())
    }

    async fn health_check(&self, timeout: Duration) -> Result<(), LlmError> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.connect_error(e))?;
        check_status(resp).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A scripted provider for tests.
///
/// Each call to `complete` pops the next queued result; an empty queue yields
/// a default response. An optional delay keeps a call in flight long enough to
/// exercise the admission gate and cancellation.
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    captured_requests: Mutex<Vec<(Vec<LlmMessage>, LlmConfig)>>,
    unloaded: Mutex<Vec<String>>,
    delay: Option<Duration>,
    local: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            captured_requests: Mutex::new(Vec::new()),
            unloaded: Mutex::new(Vec::new()),
            delay: None,
            local: false,
        }
    }

    /// Report as the local backend so requests go through the single-flight gate.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_response(self, response: LlmResponse) -> Self {
        self.push(Ok(response));
        self
    }

    /// Queue a successful response carrying `content`.
    pub fn with_text(self, content: impl Into<String>) -> Self {
        self.push(Ok(Self::response(content.into(), "mock-model")));
        self
    }

    pub fn with_error(self, error: LlmError) -> Self {
        self.push(Err(error));
        self
    }

    /// Queue a result on an already-shared provider.
    pub fn push(&self, result: Result<LlmResponse, LlmError>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn captured_requests(&self) -> Vec<(Vec<LlmMessage>, LlmConfig)> {
        self.captured_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn unloaded_models(&self) -> Vec<String> {
        self.unloaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn response(content: String, model: &str) -> LlmResponse {
        LlmResponse {
            content,
            model: model.to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "end_turn".to_string(),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        if self.local {
            "local"
        } else {
            "mock"
        }
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        self.captured_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((messages.to_vec(), config.clone()));

        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        next.unwrap_or_else(|| Ok(Self::response("Mock response".into(), &config.model)))
    }

    async fn unload_model(&self, model: &str) -> Result<(), LlmError> {
        self.unloaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(model.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            model: "test-model".to_string(),
            max_tokens: 512,
            temperature: 0.5,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn mock_returns_queued_then_default() {
        let provider = MockProvider::new().with_text("first");
        let first = provider
            .complete(&[LlmMessage::user("hi")], &config())
            .await
            .unwrap();
        assert_eq!(first.content, "first");

        let second = provider
            .complete(&[LlmMessage::user("hi")], &config())
            .await
            .unwrap();
        assert_eq!(second.content, "Mock response");
        assert_eq!(second.model, "test-model");
        assert_eq!(provider.captured_requests().len(), 2);
    }

    #[tokio::test]
    async fn mock_returns_queued_error() {
        let provider = MockProvider::new().with_error(LlmError::Timeout);
        let err = provider
            .complete(&[LlmMessage::user("hi")], &config())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
    }

    #[test]
    fn anthropic_body_lifts_system_messages() {
        let messages = vec![LlmMessage::system("be terse"), LlmMessage::user("hello")];
        let cfg = config().with_system_prompt("you plan code");
        let body = AnthropicProvider::build_request_body(&messages, &cfg);

        assert_eq!(body["system"], "you plan code\nbe terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn chat_body_inlines_system_prompt() {
        let cfg = config().with_system_prompt("sys");
        let body = chat_completions_body(&[LlmMessage::user("hello")], &cfg);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["content"], "hello");
        assert_eq!(body["model"], "test-model");
    }

    #[test]
    fn chat_response_without_choices_is_a_parse_error() {
        let resp: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[],"model":"m"}"#).unwrap();
        assert!(matches!(
            resp.into_response("m"),
            Err(LlmError::ParseError(_))
        ));
    }

    #[test]
    fn chat_response_falls_back_to_requested_model() {
        let resp: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"hi"},"finish_reason":null}]}"#,
        )
        .unwrap();
        let resp = resp.into_response("qwen").unwrap();
        assert_eq!(resp.model, "qwen");
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.finish_reason, "stop");
    }

    #[test]
    fn local_provider_ignores_placeholder_keys() {
        let provider = LocalProvider::new("http://127.0.0.1:11434/", Some("none".into()));
        assert!(provider.api_key.is_none());
        assert_eq!(provider.base_url, "http://127.0.0.1:11434");
        assert!(provider.is_local());
    }

    #[test]
    fn remote_provider_requires_credential() {
        let cfg = ProvidersConfig {
            active: ProviderKind::Anthropic,
            ..Default::default()
        };
        if CredentialProvider::anthropic_api_key().is_none() {
            let err = provider_from_config(&cfg).err().unwrap();
            assert!(matches!(err, LlmError::MissingCredential(_)));
        }
    }
}
