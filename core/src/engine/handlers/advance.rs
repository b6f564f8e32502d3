//! `advance.*`: long-term memory, history compression and parallel subtasks

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::agent::context::ExecutionContext;
use crate::agent::history::Role;
use crate::engine::{Command, CommandHandler};
use crate::services;
use crate::tools::MemoryStore;

fn default_limit() -> usize {
    5
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum MemoryOp {
    Add {
        content: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    Search {
        #[serde(alias = "content")]
        query: String,
        #[serde(default = "default_limit")]
        limit: usize,
    },
}

#[derive(Debug, Deserialize)]
struct Compress {
    ids: Vec<u64>,
    #[serde(alias = "content")]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct Parallel {
    tasks: Vec<String>,
}

pub struct AdvanceHandler {
    memory: Arc<dyn MemoryStore>,
}

impl AdvanceHandler {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self { memory }
    }

    async fn memory(&self, op: MemoryOp) -> anyhow::Result<String> {
        match op {
            MemoryOp::Add { content, tags } => {
                let id = self.memory.add(&content, tags).await?;
                Ok(format!("Saved memory {}", id))
            }
            MemoryOp::Search { query, limit } => {
                let found = self.memory.search(&query, limit).await?;
                if found.is_empty() {
                    return Ok(format!("No memories match '{}'", query));
                }
                Ok(found
                    .iter()
                    .map(|entry| format!("- {}", entry.content))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
        }
    }

    async fn compress(&self, op: Compress, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let mut history = ctx.agent.history().lock().await;
        let removed = history.delete_by_ids(&op.ids).await?;
        let summary_id = history
            .append_with(
                Role::User,
                &op.summary,
                vec![("kind".to_string(), "summary".to_string())],
            )
            .await?;
        info!(agent = %ctx.agent.id(), removed, summary_id, "compressed history");
        Ok(format!(
            "Compressed {} history entries into entry {}",
            removed, summary_id
        ))
    }

    async fn parallel(&self, op: Parallel, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let coordinator = ctx.container.get(&services::COORDINATOR).await?;
        coordinator.run_parallel(op.tasks, ctx).await
    }
}

#[async_trait]
impl CommandHandler for AdvanceHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let output = match command.str_field("cmd") {
            Some("memory") => self.memory(command.parse_op()?).await?,
            Some("compress") => self.compress(command.parse_op()?, ctx).await?,
            Some("parallel") => self.parallel(command.parse_op()?, ctx).await?,
            Some(other) => bail!("unknown advance command '{}'", other),
            None => bail!("advance command needs a cmd"),
        };
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::engine::handlers::testing;
    use crate::engine::CommandType;
    use crate::tools::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_add_and_search() {
        let handler = AdvanceHandler::new(Arc::new(InMemoryStore::new()));
        let (ctx, _events) = testing::context(Container::new());

        let add = Command::new(CommandType::Advance)
            .with("cmd", "memory")
            .with("action", "add")
            .with("content", "deploys run on fridays");
        let saved = handler.execute(&add, &ctx).await.unwrap().unwrap();
        assert!(saved.starts_with("Saved memory"));

        let search = Command::new(CommandType::Advance)
            .with("cmd", "memory")
            .with("action", "search")
            .with("query", "fridays");
        let found = handler.execute(&search, &ctx).await.unwrap();
        assert_eq!(found.as_deref(), Some("- deploys run on fridays"));
    }

    #[tokio::test]
    async fn test_compress_replaces_entries_with_summary() {
        let handler = AdvanceHandler::new(Arc::new(InMemoryStore::new()));
        let (ctx, _events) = testing::context(Container::new());
        {
            let mut history = ctx.agent.history().lock().await;
            for (role, text) in [(Role::User, "task"), (Role::Assistant, "a"), (Role::User, "b")] {
                history.append(role, text).await.unwrap();
            }
        }

        let command = Command::new(CommandType::Advance)
            .with("cmd", "compress")
            .with("ids", json!([2, 3]))
            .with("summary", "a and b happened");
        let result = handler.execute(&command, &ctx).await.unwrap().unwrap();
        assert_eq!(result, "Compressed 2 history entries into entry 4");

        let history = ctx.agent.history().lock().await;
        assert_eq!(history.len(), 2);
        let summary = history.get_by_history_id(4).unwrap();
        assert_eq!(summary.text(), "a and b happened");
        assert_eq!(summary.meta().unwrap().extra, vec![("kind".to_string(), "summary".to_string())]);
    }

    #[tokio::test]
    async fn test_parallel_without_coordinator_fails() {
        let handler = AdvanceHandler::new(Arc::new(InMemoryStore::new()));
        let (ctx, _events) = testing::context(Container::new());
        let command = Command::new(CommandType::Advance)
            .with("cmd", "parallel")
            .with("tasks", json!(["a"]));
        assert!(handler.execute(&command, &ctx).await.is_err());
    }
}
