//! Admission control and bookkeeping for model requests.
//!
//! The local inference backend can only hold one model and serve one request
//! at a time, so local calls take a single permit that is never queued for:
//! a second caller is turned away with [`LlmError::AlreadyRunning`]. Remote
//! calls skip the permit but are still registered so diagnostics can report
//! everything in flight.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ato_core::config::ProvidersConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::llm::{LlmConfig, LlmError, LlmMessage, LlmProvider};

// ---------------------------------------------------------------------------
// Request registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Chat,
    Plan,
    StepAction,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestKind::Chat => "chat",
            RequestKind::Plan => "plan",
            RequestKind::StepAction => "step_action",
        };
        write!(f, "{label}")
    }
}

/// One provider call currently in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRequest {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub kind: RequestKind,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of the runtime, suitable for printing as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub active_models: Vec<String>,
    pub active_request_count: usize,
    pub requests: Vec<ActiveRequest>,
    pub last_local_model: Option<String>,
    pub last_unload_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LocalModelState {
    last_model: Option<String>,
    last_unload_at: Option<DateTime<Utc>>,
}

/// Deregisters its request when dropped, whatever way the call ended.
pub struct RequestGuard {
    id: Uuid,
    requests: Arc<DashMap<Uuid, ActiveRequest>>,
}

impl RequestGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.requests.remove(&self.id);
    }
}

/// Shared gate and registry. Cloning yields another handle onto the same state.
#[derive(Clone)]
pub struct RuntimeDiagnostics {
    local_slot: Arc<Semaphore>,
    requests: Arc<DashMap<Uuid, ActiveRequest>>,
    local_state: Arc<Mutex<LocalModelState>>,
}

impl Default for RuntimeDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeDiagnostics {
    pub fn new() -> Self {
        Self {
            local_slot: Arc::new(Semaphore::new(1)),
            requests: Arc::new(DashMap::new()),
            local_state: Arc::new(Mutex::new(LocalModelState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalModelState> {
        self.local_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the local slot without waiting.
    pub fn try_acquire_local(&self, model: &str) -> Result<OwnedSemaphorePermit, LlmError> {
        self.local_slot.clone().try_acquire_owned().map_err(|_| {
            let running = self
                .requests
                .iter()
                .find(|r| r.provider == "local")
                .map(|r| r.model.clone())
                .unwrap_or_else(|| model.to_string());
            LlmError::AlreadyRunning { model: running }
        })
    }

    /// Register an in-flight request.
    pub fn begin(&self, provider: &str, model: &str, kind: RequestKind) -> RequestGuard {
        let id = Uuid::new_v4();
        self.requests.insert(
            id,
            ActiveRequest {
                id,
                provider: provider.to_string(),
                model: model.to_string(),
                kind,
                started_at: Utc::now(),
            },
        );
        RequestGuard {
            id,
            requests: Arc::clone(&self.requests),
        }
    }

    pub fn active_request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn last_local_model(&self) -> Option<String> {
        self.state().last_model.clone()
    }

    pub fn last_unload_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_unload_at
    }

    /// Record `model` as loaded and return the model it displaces, if any.
    fn swap_local_model(&self, model: &str) -> Option<String> {
        let mut state = self.state();
        let previous = state.last_model.replace(model.to_string());
        previous.filter(|prev| prev != model)
    }

    fn record_unload(&self) {
        self.state().last_unload_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut requests: Vec<ActiveRequest> =
            self.requests.iter().map(|r| r.value().clone()).collect();
        requests.sort_by_key(|r| r.started_at);
        let active_models: BTreeSet<String> = requests.iter().map(|r| r.model.clone()).collect();
        let state = self.state();
        DiagnosticsSnapshot {
            active_models: active_models.into_iter().collect(),
            active_request_count: requests.len(),
            requests,
            last_local_model: state.last_model.clone(),
            last_unload_at: state.last_unload_at,
        }
    }

    /// Drop every registration and forget the loaded model.
    pub fn reset(&self) {
        self.requests.clear();
        *self.state() = LocalModelState::default();
    }
}

// ---------------------------------------------------------------------------
// ModelGateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub kind: RequestKind,
    /// Overrides the configured model for this call.
    pub model: Option<String>,
}

impl GenerateRequest {
    pub fn new(kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            kind,
            model: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// The only path from the orchestrator to a provider.
#[derive(Clone)]
pub struct ModelGateway {
    provider: Arc<dyn LlmProvider>,
    diagnostics: RuntimeDiagnostics,
    config: ProvidersConfig,
}

impl ModelGateway {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        diagnostics: RuntimeDiagnostics,
        config: ProvidersConfig,
    ) -> Self {
        Self {
            provider,
            diagnostics,
            config,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn diagnostics(&self) -> &RuntimeDiagnostics {
        &self.diagnostics
    }

    /// Run one completion and return its text.
    ///
    /// Fails with [`LlmError::Cancelled`] as soon as `cancel` fires; the
    /// provider future is dropped, which aborts the HTTP request.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        let local = self.provider.is_local();

        let _permit = if local {
            Some(self.diagnostics.try_acquire_local(&model)?)
        } else {
            None
        };
        let guard = self
            .diagnostics
            .begin(self.provider.name(), &model, request.kind);
        debug!(request_id = %guard.id(), provider = self.provider.name(), %model, kind = %request.kind, "model request started");

        if local {
            if let Some(previous) = self.diagnostics.swap_local_model(&model) {
                info!(%previous, next = %model, "unloading previous local model");
                if let Err(e) = self.provider.unload_model(&previous).await {
                    warn!(%previous, error = %e, "failed to unload local model");
                }
                self.diagnostics.record_unload();
            }
        }

        let config = LlmConfig {
            model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system_prompt: request.system_prompt,
        };
        let messages = [LlmMessage::user(request.prompt)];
        let timeout = Duration::from_secs(self.config.request_timeout_secs);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(request_id = %guard.id(), "model request cancelled");
                return Err(LlmError::Cancelled);
            }
            result = tokio::time::timeout(timeout, self.provider.complete(&messages, &config)) => {
                result.map_err(|_| LlmError::Timeout)??
            }
        };

        if response.content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        debug!(
            request_id = %guard.id(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "model request finished"
        );
        Ok(response.content)
    }

    /// Probe the backend with the configured health timeout.
    pub async fn health_check(&self) -> Result<(), LlmError> {
        self.provider
            .health_check(Duration::from_secs(self.config.health_timeout_secs))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;

    fn gateway(provider: MockProvider) -> (ModelGateway, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        let gw = ModelGateway::new(
            provider.clone(),
            RuntimeDiagnostics::new(),
            ProvidersConfig::default(),
        );
        (gw, provider)
    }

    #[tokio::test]
    async fn blank_completion_is_an_error() {
        let (gw, _) = gateway(MockProvider::new().with_text("   \n"));
        let err = gw
            .generate(
                GenerateRequest::new(RequestKind::Chat, "hi"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }

    #[tokio::test]
    async fn registry_is_empty_after_failure() {
        let (gw, _) = gateway(MockProvider::new().local().with_error(LlmError::Timeout));
        let _ = gw
            .generate(
                GenerateRequest::new(RequestKind::Plan, "hi"),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(gw.diagnostics().active_request_count(), 0);
        assert!(gw.diagnostics().try_acquire_local("m").is_ok());
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_reaches_provider() {
        let (gw, provider) = gateway(MockProvider::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = gw
            .generate(GenerateRequest::new(RequestKind::Chat, "hi"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
        assert!(provider.captured_requests().is_empty());
    }

    #[tokio::test]
    async fn system_prompt_and_model_override_are_forwarded() {
        let (gw, provider) = gateway(MockProvider::new().with_text("ok"));
        gw.generate(
            GenerateRequest::new(RequestKind::Chat, "hi")
                .with_system_prompt(Some("sys".into()))
                .with_model("other"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let (messages, config) = provider.captured_requests().remove(0);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(config.model, "other");
        assert_eq!(config.system_prompt.as_deref(), Some("sys"));
    }

    #[test]
    fn snapshot_lists_active_requests() {
        let diag = RuntimeDiagnostics::new();
        let a = diag.begin("local", "qwen", RequestKind::Plan);
        let _b = diag.begin("anthropic", "claude", RequestKind::Chat);
        let _c = diag.begin("anthropic", "claude", RequestKind::StepAction);

        let snap = diag.snapshot();
        assert_eq!(snap.active_request_count, 3);
        assert_eq!(snap.active_models, vec!["claude".to_string(), "qwen".to_string()]);

        drop(a);
        assert_eq!(diag.snapshot().active_request_count, 2);
    }
}
