//! Configuration management
//!
//! A single TOML file, `<config dir>/weft/config.toml`, overlaid with
//! `WEFT_*` environment variables. Every section falls back to defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::agent::core::AgentSettings;
use crate::engine::{ApprovalPolicy, DEFAULT_RESULT_CAP};
use crate::error::{Result, WeftError};
use crate::ipc::SupervisorConfig;
use crate::llm::OpenAiSettings;
use crate::services::RuntimeSettings;

pub const ENV_API_KEY: &str = "WEFT_API_KEY";
pub const ENV_BASE_URL: &str = "WEFT_BASE_URL";
pub const ENV_MODEL: &str = "WEFT_MODEL";

const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    /// `tracing` filter used when `RUST_LOG` is unset
    pub log_level: Option<String>,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub history: HistoryConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    /// Prompt size, in tokens, that triggers history truncation
    pub context_window: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1".to_string(),
            api_key: None,
            max_tokens: None,
            context_window: 128_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_turns: usize,
    /// Characters kept from each command result
    pub result_cap: usize,
    /// Command keys that run without asking; `*` suffix matches any rest
    pub allow: Vec<String>,
    /// Command keys that always ask, even when allowed or auto-approved
    pub deny: Vec<String>,
    pub auto_approve: bool,
    pub extra_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: crate::agent::core::DEFAULT_MAX_TURNS,
            result_cap: DEFAULT_RESULT_CAP,
            allow: ["file.read", "file.list", "file.search", "plan.*", "advance.memory.*", "advance.compress"]
                .into_iter()
                .map(String::from)
                .collect(),
            deny: Vec::new(),
            auto_approve: false,
            extra_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Defaults to `<data dir>/weft`
    pub data_dir: Option<PathBuf>,
    pub persist: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            persist: true,
        }
    }
}

impl WeftConfig {
    /// `<config dir>/weft/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("weft").join("config.toml"))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load `explicit` (which must exist) or the default file (which may
    /// not), then apply environment overrides.
    pub fn load_or_default(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match Self::default_path().filter(|path| path.exists()) {
                Some(path) => Self::load(path)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content).with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Overlay `WEFT_*` values; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value: &String| !value.trim().is_empty());
        if let Some(api_key) = lookup(ENV_API_KEY) {
            self.llm.api_key = Some(api_key);
        }
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.llm.base_url = base_url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.llm.model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(WeftError::InvalidConfig {
                message: message.to_string(),
            })
        };
        if self.llm.base_url.trim().is_empty() {
            return invalid("llm.base_url must not be empty");
        }
        if self.llm.model.trim().is_empty() {
            return invalid("llm.model must not be empty");
        }
        if self.llm.context_window == 0 {
            return invalid("llm.context_window must be positive");
        }
        if self.agent.max_turns == 0 {
            return invalid("agent.max_turns must be positive");
        }
        if self.agent.result_cap == 0 {
            return invalid("agent.result_cap must be positive");
        }
        Ok(())
    }

    pub fn openai_settings(&self) -> OpenAiSettings {
        OpenAiSettings {
            base_url: self.llm.base_url.clone(),
            model: self.llm.model.clone(),
            api_key: self.llm.api_key.clone(),
            max_tokens: self.llm.max_tokens,
            context_window: self.llm.context_window,
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            agent: AgentSettings {
                max_turns: self.agent.max_turns,
                extra_prompt: self.agent.extra_prompt.clone(),
            },
            result_cap: self.agent.result_cap,
            approval: ApprovalPolicy {
                allow: self.agent.allow.clone(),
                deny: self.agent.deny.clone(),
                auto_approve: self.agent.auto_approve,
            },
        }
    }

    /// Where the root agent's history lives, `None` when not persisted
    pub fn history_path(&self) -> Option<PathBuf> {
        if !self.history.persist {
            return None;
        }
        self.history
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("weft")))
            .map(|dir| dir.join(HISTORY_FILE))
    }
}
