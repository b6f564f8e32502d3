//! `file.*`: workspace file operations through [`FileOps`]

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::download_progress;
use crate::agent::context::ExecutionContext;
use crate::engine::{Command, CommandHandler};
use crate::tools::FileOps;

fn current_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum FileOp {
    Read {
        path: String,
    },
    Create {
        path: String,
        #[serde(default)]
        content: String,
    },
    List {
        #[serde(default = "current_dir")]
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Search {
        #[serde(default = "current_dir")]
        path: String,
        #[serde(alias = "query")]
        pattern: String,
    },
    Edit {
        path: String,
        search: String,
        #[serde(default)]
        replace: String,
    },
    Download {
        url: String,
        path: String,
    },
    Rename {
        #[serde(alias = "path")]
        from: String,
        to: String,
    },
}

pub struct FileHandler {
    files: Arc<dyn FileOps>,
}

impl FileHandler {
    pub fn new(files: Arc<dyn FileOps>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl CommandHandler for FileHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let output = match command.parse_op::<FileOp>()? {
            FileOp::Read { path } => self.files.read(&path).await?,
            FileOp::Create { path, content } => self.files.create(&path, &content).await?,
            FileOp::List { path, recursive } => {
                let entries = self.files.list(&path, recursive).await?;
                if entries.is_empty() {
                    format!("{} is empty", path)
                } else {
                    entries.join("\n")
                }
            }
            FileOp::Search { path, pattern } => {
                let matches = self.files.search(&path, &pattern).await?;
                if matches.is_empty() {
                    format!("No matches for '{}' in {}", pattern, path)
                } else {
                    matches
                        .iter()
                        .map(|m| format!("{}:{}: {}", m.path, m.line, m.text))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            FileOp::Edit { path, search, replace } => self.files.edit(&path, &search, &replace).await?,
            FileOp::Download { url, path } => {
                let progress = download_progress(&ctx.agent, path.clone());
                self.files.download(&url, &path, Some(progress)).await?
            }
            FileOp::Rename { from, to } => self.files.rename(&from, &to).await?,
        };
        Ok(Some(output))
    }
}
