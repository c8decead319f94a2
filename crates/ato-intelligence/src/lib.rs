//! Model access for the orchestrator.
//!
//! - [`llm`] -- provider trait plus Anthropic, OpenAI, local and mock backends
//! - [`runtime`] -- the single-flight gate over the local backend, the
//!   in-flight request registry, and [`runtime::ModelGateway`]

pub mod llm;
pub mod runtime;

pub use llm::{
    provider_from_config, AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider,
    LlmResponse, LlmRole, LocalProvider, MockProvider, OpenAiProvider,
};
pub use runtime::{GenerateRequest, ModelGateway, RequestKind, RuntimeDiagnostics};
