use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::TaskMode;

/// Top-level configuration loaded from `~/.agent-orchestrator/config.toml`.
///
/// API keys never live here; see [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

impl Config {
    /// Load config from the default location, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Write the config to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        std::fs::write(path, text).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.providers.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agent-orchestrator")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory under which per-goal workspaces are created.
    #[serde(default = "default_workspace_base_dir")]
    pub workspace_base_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            workspace_base_dir: default_workspace_base_dir(),
        }
    }
}

impl GeneralConfig {
    /// Workspace base directory with a leading `~` expanded.
    pub fn workspace_base_path(&self) -> PathBuf {
        expand_home(&self.workspace_base_dir)
    }
}

fn default_workspace_base_dir() -> String {
    "~/AgentWorkspaces".into()
}

/// Which backend serves model calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Local,
    Anthropic,
    Openai,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProviderKind::Local => "local",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub active: ProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    /// Local inference server base URL (Ollama or any OpenAI-compatible server).
    #[serde(default = "default_local_base_url")]
    pub local_base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            active: ProviderKind::default(),
            model: default_model(),
            local_base_url: default_local_base_url(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            health_timeout_secs: default_health_timeout(),
        }
    }
}

impl ProvidersConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "providers.model must not be empty".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Validation(format!(
                "providers.temperature must be within 0.0..=2.0 (got {})",
                self.temperature
            )));
        }
        if self.request_timeout_secs == 0 || self.health_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "provider timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_model() -> String {
    "qwen2.5-coder:14b".into()
}

fn default_local_base_url() -> String {
    "http://127.0.0.1:11434".into()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.2
}

fn default_request_timeout() -> u64 {
    20 * 60
}

fn default_health_timeout() -> u64 {
    5
}

/// Independent gates on what step actions may touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default = "default_true")]
    pub allow_file_write: bool,
    #[serde(default = "default_true")]
    pub allow_terminal: bool,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            allow_file_write: true,
            allow_terminal: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Whether new tasks run the validation battery after their steps.
    #[serde(default = "default_true")]
    pub auto_run_default: bool,
    /// Battery for workspaces containing `package.json`.
    #[serde(default = "default_node_commands")]
    pub node_commands: Vec<String>,
    /// Battery for workspaces containing `Cargo.toml`.
    #[serde(default = "default_cargo_commands")]
    pub cargo_commands: Vec<String>,
    /// Wall clock for one-shot commands run outside the pipeline.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Delay between SIGTERM and SIGKILL for a timed-out one-shot command.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_run_default: true,
            node_commands: default_node_commands(),
            cargo_commands: default_cargo_commands(),
            command_timeout_secs: default_command_timeout(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "pipeline.command_timeout_secs must be greater than zero".into(),
            ));
        }
        if let Some(blank) = self
            .node_commands
            .iter()
            .chain(self.cargo_commands.iter())
            .find(|c| c.trim().is_empty())
        {
            return Err(ConfigError::Validation(format!(
                "pipeline commands must not be blank (got {blank:?})"
            )));
        }
        Ok(())
    }
}

fn default_node_commands() -> Vec<String> {
    vec![
        "npm run build --if-present".into(),
        "npm run typecheck --if-present".into(),
    ]
}

fn default_cargo_commands() -> Vec<String> {
    vec!["cargo build".into()]
}

fn default_command_timeout() -> u64 {
    30
}

fn default_kill_grace() -> u64 {
    2
}

/// Optional per-mode system prompt overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptsConfig {
    #[serde(default)]
    pub chat: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub coding: Option<String>,
    #[serde(default)]
    pub bugfix: Option<String>,
}

impl PromptsConfig {
    /// Configured override for a task mode, ignoring blank entries.
    pub fn for_mode(&self, mode: TaskMode) -> Option<&str> {
        let prompt = match mode {
            TaskMode::Plan => self.plan.as_deref(),
            TaskMode::Build => self.build.as_deref(),
            TaskMode::Coding => self.coding.as_deref(),
            TaskMode::Bugfix => self.bugfix.as_deref(),
        };
        prompt.filter(|p| !p.trim().is_empty())
    }

    pub fn for_chat(&self) -> Option<&str> {
        self.chat.as_deref().filter(|p| !p.trim().is_empty())
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(raw)
    }
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Reads credentials from environment variables at runtime.
pub struct CredentialProvider;

impl CredentialProvider {
    pub fn anthropic_api_key() -> Option<String> {
        Self::from_env("ANTHROPIC_API_KEY")
    }

    pub fn openai_api_key() -> Option<String> {
        Self::from_env("OPENAI_API_KEY")
    }

    /// Optional key for local servers started with `--api-key`.
    pub fn local_api_key() -> Option<String> {
        Self::from_env("ATO_LOCAL_API_KEY")
    }

    /// Read a credential from a named env var, treating blank values as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
