use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::mcp::MCPServerConfig;
use crate::tools::ToolEffect;

pub const DEFAULT_CONFIG_FILE: &str = "abid.json";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("No API key for provider {provider}; set {env_key} or API_KEY")]
    MissingApiKey {
        provider: Provider,
        env_key: &'static str,
    },
    #[error("Working directory does not exist: {0}")]
    InvalidWorkingDirectory(PathBuf),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Unknown approval policy: {0}")]
    UnknownApprovalPolicy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ollama,
    Gemini,
    Mistral,
    OpenAI,
    Groq,
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OpenAICompatible,
    Ollama,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderInfo {
    pub base_url: &'static str,
    pub default_model: &'static str,
    pub vision_model: &'static str,
    pub env_key: &'static str,
    pub default_key: Option<&'static str>,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Ollama,
        Provider::Gemini,
        Provider::Mistral,
        Provider::OpenAI,
        Provider::Groq,
    ];

    pub fn info(&self) -> ProviderInfo {
        match self {
            Provider::Ollama => ProviderInfo {
                base_url: "http://localhost:11434/v1",
                default_model: "qwen2.5-coder:7b",
                vision_model: "llava:7b",
                env_key: "OLLAMA_API_KEY",
                default_key: Some("ollama"),
            },
            Provider::Gemini => ProviderInfo {
                base_url: "https://generativelanguage.googleapis.com/v1beta/openai/",
                default_model: "gemini-2.0-flash",
                vision_model: "gemini-2.0-flash",
                env_key: "GEMINI_API_KEY",
                default_key: None,
            },
            Provider::Mistral => ProviderInfo {
                base_url: "https://api.mistral.ai/v1",
                default_model: "open-mistral-nemo",
                vision_model: "pixtral-12b-2409",
                env_key: "MISTRAL_API_KEY",
                default_key: None,
            },
            Provider::OpenAI => ProviderInfo {
                base_url: "https://api.openai.com/v1",
                default_model: "gpt-4o-mini",
                vision_model: "gpt-4o-mini",
                env_key: "OPENAI_API_KEY",
                default_key: None,
            },
            Provider::Groq => ProviderInfo {
                base_url: "https://api.groq.com/openai/v1",
                default_model: "llama-3.3-70b-versatile",
                vision_model: "llama-3.2-90b-vision-preview",
                env_key: "GROQ_API_KEY",
                default_key: None,
            },
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Provider::Ollama => Backend::Ollama,
            Provider::Gemini => Backend::Gemini,
            Provider::Mistral | Provider::OpenAI | Provider::Groq => Backend::OpenAICompatible,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::Gemini => "gemini",
            Provider::Mistral => "mistral",
            Provider::OpenAI => "openai",
            Provider::Groq => "groq",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| ConfigError::UnknownProvider(s.to_string()))
    }
}

/// Whether a tool call needs a human decision before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    #[default]
    OnRequest,
    OnFailure,
    Auto,
    AutoEdit,
    Never,
    Yolo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    Ask,
    Deny,
    /// Run without asking; on failure ask whether to retry once.
    AllowThenAskOnFailure,
}

impl ApprovalPolicy {
    pub const ALL: [ApprovalPolicy; 6] = [
        ApprovalPolicy::OnRequest,
        ApprovalPolicy::OnFailure,
        ApprovalPolicy::Auto,
        ApprovalPolicy::AutoEdit,
        ApprovalPolicy::Never,
        ApprovalPolicy::Yolo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::Auto => "auto",
            ApprovalPolicy::AutoEdit => "auto-edit",
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::Yolo => "yolo",
        }
    }

    pub fn decide(&self, effect: ToolEffect) -> ApprovalDecision {
        match (self, effect) {
            (ApprovalPolicy::Auto | ApprovalPolicy::Yolo, _) => ApprovalDecision::Allow,
            (_, ToolEffect::ReadOnly) => ApprovalDecision::Allow,
            (ApprovalPolicy::Never, _) => ApprovalDecision::Deny,
            (ApprovalPolicy::OnFailure, _) => ApprovalDecision::AllowThenAskOnFailure,
            (ApprovalPolicy::AutoEdit, ToolEffect::Edit) => ApprovalDecision::Allow,
            (ApprovalPolicy::AutoEdit | ApprovalPolicy::OnRequest, _) => ApprovalDecision::Ask,
        }
    }
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase().replace('_', "-");
        ApprovalPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| ConfigError::UnknownApprovalPolicy(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Provider,
    /// Falls back to the provider's default model.
    pub name: Option<String>,
    pub vision_model: Option<String>,
    pub temperature: f32,
    pub context_window: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            name: None,
            vision_model: None,
            temperature: 0.7,
            context_window: 32_000,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub cwd: PathBuf,
    pub approval: ApprovalPolicy,
    pub max_turns: usize,
    pub mcp_servers: BTreeMap<String, MCPServerConfig>,
    pub allowed_tools: Option<Vec<String>>,
    pub developer_instructions: Option<String>,
    pub user_instructions: Option<String>,
    pub debug: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tool_timeout: Duration,
    pub max_retries: u32,
    pub data_dir: Option<PathBuf>,
    /// Explicit key; takes precedence over the environment.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            cwd: PathBuf::from("."),
            approval: ApprovalPolicy::default(),
            max_turns: 200,
            mcp_servers: BTreeMap::new(),
            allowed_tools: None,
            developer_instructions: None,
            user_instructions: None,
            debug: false,
            tool_timeout: Duration::from_secs(120),
            max_retries: 3,
            data_dir: None,
            api_key: None,
            base_url: None,
        }
    }
}

impl Config {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn model_name(&self) -> String {
        self.model
            .name
            .clone()
            .unwrap_or_else(|| self.model.provider.info().default_model.to_string())
    }

    pub fn vision_model_name(&self) -> String {
        self.model
            .vision_model
            .clone()
            .unwrap_or_else(|| self.model.provider.info().vision_model.to_string())
    }

    pub fn api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        resolve_api_key(self.model.provider, |name| std::env::var(name).ok())
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .or_else(|| std::env::var("BASE_URL").ok().filter(|url| !url.is_empty()))
            .unwrap_or_else(|| self.model.provider.info().base_url.to_string())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("abid"))
                .unwrap_or_else(|| PathBuf::from(".abid"))
        })
    }

    /// Checks everything that must hold before a session starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key().is_none() {
            let provider = self.model.provider;
            return Err(ConfigError::MissingApiKey {
                provider,
                env_key: provider.info().env_key,
            });
        }
        if !self.cwd.is_dir() {
            return Err(ConfigError::InvalidWorkingDirectory(self.cwd.clone()));
        }
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid("max_turns must be at least 1".into()));
        }
        if self.model.context_window == 0 {
            return Err(ConfigError::Invalid(
                "model.context_window must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Provider env var, then `API_KEY`, then the provider's built-in key.
pub fn resolve_api_key(
    provider: Provider,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let info = provider.info();
    lookup(info.env_key)
        .filter(|key| !key.is_empty())
        .or_else(|| lookup("API_KEY").filter(|key| !key.is_empty()))
        .or_else(|| info.default_key.map(String::from))
}
