//! Configuration for YoctoClaw
//!
//! Configuration is loaded from a JSON file (`~/.yoctoclaw/config.json` by
//! default). Every struct carries serde defaults so a partial config file is
//! always valid; an absent file yields the built-in defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, YoctoError};

/// Main configuration struct for YoctoClaw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The agent profile used when a contact names none.
    pub default_agent: String,
    /// Agent profiles keyed by id. The default profile may be omitted; it
    /// is synthesized from built-in defaults on resolution.
    pub agents: HashMap<String, AgentProfileConfig>,
    /// When true, only sessions with a registered contact policy get
    /// responses (internal channels `cli` and `cron` always pass).
    pub contacts_only: bool,
    /// Reply used when a turn produces empty final content.
    pub default_response: String,
    /// LLM provider configuration.
    pub provider: ProviderConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Per-agent profile: workspace, model, limits, and MCP servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfileConfig {
    /// Workspace directory for this agent (leading `~` expands to home).
    pub workspace: String,
    /// Model name passed to the provider.
    pub model: String,
    /// Context window budget in tokens, used by the summarization trigger.
    pub context_window_tokens: usize,
    /// Maximum LLM/tool iterations inside one turn.
    pub max_tool_iterations: usize,
    /// MCP tool server subprocesses for this profile.
    pub mcp_servers: Vec<McpServerSpec>,
}

impl Default for AgentProfileConfig {
    fn default() -> Self {
        Self {
            workspace: "~/.yoctoclaw/workspace".to_string(),
            model: String::new(),
            context_window_tokens: 128_000,
            max_tool_iterations: 10,
            mcp_servers: Vec::new(),
        }
    }
}

/// Launch spec for one MCP tool server subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerSpec {
    /// Unique server name within the profile; prefixes tool names.
    pub name: String,
    /// Executable to spawn (never run via a shell).
    pub command: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Extra environment variables merged over the inherited environment.
    pub env: HashMap<String, String>,
    /// Disabled servers are recorded in status but never started.
    pub enabled: bool,
}

impl Default for McpServerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
        }
    }
}

/// LLM provider configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Base URL of the chat-completions endpoint.
    pub api_base: String,
    /// Default model when the agent profile names none.
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, coloured.
    Pretty,
    /// Single-line, grep-friendly.
    Compact,
    /// JSON lines for aggregators.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Optional file sink (JSON format only); stderr otherwise.
    pub file: Option<String>,
    /// Default filter level when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            file: None,
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// The YoctoClaw home directory (`~/.yoctoclaw`).
    pub fn dir() -> PathBuf {
        dirs_home().join(".yoctoclaw")
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&content)
            .map_err(|e| YoctoError::Config(format!("parse {}: {}", path.display(), e)))?;
        Ok(cfg)
    }

    /// The id of the default agent profile.
    pub fn default_agent_id(&self) -> &str {
        if self.default_agent.is_empty() {
            "default"
        } else {
            &self.default_agent
        }
    }

    /// Ids of all configured agent profiles.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a profile id to a concrete profile, falling back to the
    /// built-in defaults for anything the config leaves unset.
    pub fn resolve_profile(&self, agent_id: &str) -> ResolvedProfile {
        let base = self.agents.get(agent_id).cloned().unwrap_or_default();
        let model = if base.model.is_empty() {
            self.provider.model.clone()
        } else {
            base.model
        };
        ResolvedProfile {
            agent_id: agent_id.to_string(),
            workspace: expand_home(&base.workspace),
            model,
            context_window_tokens: base.context_window_tokens,
            max_tool_iterations: base.max_tool_iterations.max(1),
            mcp_servers: base.mcp_servers,
        }
    }

    /// Reply used when a turn produces no content.
    pub fn default_response(&self) -> &str {
        if self.default_response.is_empty() {
            "I've completed processing but have no response to give."
        } else {
            &self.default_response
        }
    }
}

/// An agent profile after defaulting and path expansion.
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub agent_id: String,
    pub workspace: PathBuf,
    pub model: String,
    pub context_window_tokens: usize,
    pub max_tool_iterations: usize,
    pub mcp_servers: Vec<McpServerSpec>,
}

fn dirs_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs_home();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return dirs_home().join(rest);
    }
    PathBuf::from(path)
}
