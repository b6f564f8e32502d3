//! External tool collaborators
//!
//! Narrow contracts for everything a command handler delegates to. The
//! handlers own the dispatch; these traits own the side effects.

pub mod fs;
pub mod memory;
pub mod shell;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use fs::LocalFileOps;
pub use memory::InMemoryStore;
pub use shell::ShellRunner;

/// Progress of a running download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<u8> {
        let total = self.total.filter(|total| *total > 0)?;
        Some(((self.downloaded.min(total) * 100) / total) as u8)
    }
}

pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// One hit of a content search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

#[async_trait]
pub trait FileOps: Send + Sync {
    async fn read(&self, path: &str) -> anyhow::Result<String>;

    async fn create(&self, path: &str, content: &str) -> anyhow::Result<String>;

    async fn list(&self, path: &str, recursive: bool) -> anyhow::Result<Vec<String>>;

    async fn search(&self, path: &str, pattern: &str) -> anyhow::Result<Vec<SearchMatch>>;

    /// Replace the first occurrence of `search` with `replace`
    async fn edit(&self, path: &str, search: &str, replace: &str) -> anyhow::Result<String>;

    async fn rename(&self, from: &str, to: &str) -> anyhow::Result<String>;

    async fn download(&self, url: &str, path: &str, progress: Option<ProgressFn>) -> anyhow::Result<String>;
}

/// Browser operations, keyed by the command's `action` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrowserAction {
    Open {
        url: String,
    },
    Search {
        query: String,
    },
    State,
    Analyze {
        #[serde(default)]
        question: Option<String>,
    },
    Navigation {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        direction: Option<String>,
    },
    Interact {
        selector: String,
        #[serde(default = "default_interaction")]
        operation: String,
        #[serde(default)]
        value: Option<String>,
    },
    Auth {
        site: String,
    },
    Download {
        url: String,
        path: String,
    },
}

fn default_interaction() -> String {
    "click".to_string()
}

impl BrowserAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Search { .. } => "search",
            Self::State => "state",
            Self::Analyze { .. } => "analyze",
            Self::Navigation { .. } => "navigation",
            Self::Interact { .. } => "interact",
            Self::Auth { .. } => "auth",
            Self::Download { .. } => "download",
        }
    }
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn perform(&self, action: BrowserAction, progress: Option<ProgressFn>) -> anyhow::Result<String>;
}

#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Run a shell command line
    async fn run_shell(&self, command: &str, cwd: Option<&str>) -> anyhow::Result<String>;

    /// Evaluate a JavaScript snippet
    async fn run_node(&self, code: &str) -> anyhow::Result<String>;
}

/// Tool exposed by an external hub server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// External-tool hub (MCP servers)
#[async_trait]
pub trait ToolHub: Send + Sync {
    async fn list_servers(&self) -> anyhow::Result<Vec<String>>;

    async fn list_tools(&self, server: &str) -> anyhow::Result<Vec<HubTool>>;

    async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> anyhow::Result<String>;
}

/// Questions for the human operator
#[async_trait]
pub trait UserPrompt: Send + Sync {
    async fn ask(&self, question: &str, options: &[String]) -> anyhow::Result<String>;

    async fn confirm(&self, message: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add(&self, content: &str, tags: Vec<String>) -> anyhow::Result<String>;

    async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<MemoryEntry>>;
}

/// Host-provided commands reached through the process boundary
#[async_trait]
pub trait ExternalBridge: Send + Sync {
    async fn call(&self, request: Value) -> anyhow::Result<String>;
}
