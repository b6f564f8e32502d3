//! Agent turn loop
//!
//! One turn streams a model response, feeds the accumulated text through
//! the block processor and executes each finished tool block through the
//! command engine, strictly one at a time. Tool results go back to the
//! model as the next user message.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::context::{AgentEvent, AgentHandle, ExecutionContext};
use super::coordinator::{AgentSpawner, ClineStatus, SpawnRequest};
use super::history::{ConversationHistory, Role};
use super::parser::Block;
use super::processor::BlockProcessor;
use super::prompt;
use crate::container::Container;
use crate::engine::{Command, CommandEngine};
use crate::error::{Result, WeftError};
use crate::llm::{ApiChunk, ApiHandler, TokenUsage};
use crate::services;

pub const DEFAULT_MAX_TURNS: usize = 25;

/// Assistant entry that closes an unanswered user entry left by a stopped run
const INTERRUPTED_NOTE: &str = "(The previous run stopped before finishing.)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub max_turns: usize,
    /// Appended to the built-in system prompt
    pub extra_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            extra_prompt: None,
        }
    }
}

/// What one streamed response produced
#[derive(Debug, Default)]
struct TurnOutcome {
    assistant_text: String,
    text_blocks: Vec<String>,
    results: Vec<String>,
    tool_calls: usize,
    usage: Option<TokenUsage>,
    /// Blocks already shown to the operator while still partial
    previewed: HashSet<usize>,
}

pub struct Agent {
    handle: AgentHandle,
    container: Arc<Container>,
    settings: AgentSettings,
    message_seq: AtomicU64,
}

impl Agent {
    pub fn new(handle: AgentHandle, container: Arc<Container>, settings: AgentSettings) -> Self {
        Self {
            handle,
            container,
            settings,
            message_seq: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> &AgentHandle {
        &self.handle
    }

    /// Work on `task` until the model finishes, gives up or is aborted
    pub async fn run(&self, task: &str) -> Result<String> {
        let outcome = self.run_turns(task).await;
        if let Err(err) = &outcome {
            self.handle.emit(AgentEvent::Failed {
                agent_id: self.handle.id().to_string(),
                message: err.user_message(),
            });
        }
        outcome
    }

    async fn run_turns(&self, task: &str) -> Result<String> {
        let api = self.container.get(&services::API_HANDLER).await?;
        let engine = self.container.get(&services::COMMAND_ENGINE).await?;
        let hub = self.container.get_optional(&services::TOOL_HUB).await?;
        let ctx = ExecutionContext::new(self.handle.clone(), self.container.clone()).with_hub(hub);
        let system_prompt = prompt::system_prompt(
            self.handle.parent_id().is_some(),
            self.settings.extra_prompt.as_deref(),
        );
        let context_window = api.model().context_window;

        {
            let mut history = self.handle.history().lock().await;
            // A run that stopped early leaves its tool results as the last entry.
            if history.last().is_some_and(|item| item.role == Role::User) {
                history.append(Role::Assistant, INTERRUPTED_NOTE).await?;
            }
            history.append(Role::User, task).await?;
        }
        info!(agent = %self.handle.id(), "task started");

        for turn in 1..=self.settings.max_turns {
            if self.handle.is_cancelled() {
                return Err(WeftError::Aborted);
            }
            debug!(agent = %self.handle.id(), turn, "starting turn");

            let outcome = self.turn(api.as_ref(), &engine, &ctx, &system_prompt).await?;
            let mut history = self.handle.history().lock().await;
            if !outcome.assistant_text.trim().is_empty() {
                history.append(Role::Assistant, &outcome.assistant_text).await?;
            }

            if let Some(result) = self.handle.completion() {
                drop(history);
                return Ok(self.finish(result));
            }
            if outcome.tool_calls == 0 {
                drop(history);
                return Ok(self.finish(outcome.text_blocks.join("\n\n")));
            }

            history.append(Role::User, &outcome.results.join("\n\n")).await?;
            if let Some(usage) = outcome.usage {
                if usage.total_tokens >= context_window {
                    warn!(
                        agent = %self.handle.id(),
                        used = usage.total_tokens,
                        window = context_window,
                        "context window exceeded, truncating history"
                    );
                    history.truncate_half().await?;
                }
            }
        }

        Err(WeftError::TurnLimitReached {
            max_turns: self.settings.max_turns,
        })
    }

    fn finish(&self, result: String) -> String {
        info!(agent = %self.handle.id(), "task finished");
        self.handle.emit(AgentEvent::Completed {
            agent_id: self.handle.id().to_string(),
            result: result.clone(),
        });
        result
    }

    async fn turn(
        &self,
        api: &dyn ApiHandler,
        engine: &CommandEngine,
        ctx: &ExecutionContext,
        system_prompt: &str,
    ) -> Result<TurnOutcome> {
        let items = self.handle.history().lock().await.items().to_vec();
        let mut stream = api.create_message(system_prompt, &items);
        let mut processor = BlockProcessor::new();
        let mut outcome = TurnOutcome::default();

        loop {
            let chunk = tokio::select! {
                _ = self.handle.cancellation().cancelled() => return Err(WeftError::Aborted),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };

            match chunk.map_err(|e| WeftError::Stream {
                message: format!("{:#}", e),
            })? {
                ApiChunk::Text(delta) => {
                    outcome.assistant_text.push_str(&delta);
                    processor.set_blocks(&outcome.assistant_text);
                    if processor.has_new_block() {
                        self.assign_message_ids(&mut processor);
                    }
                    self.drain(&mut processor, engine, ctx, &mut outcome).await?;
                }
                ApiChunk::Reasoning(content) => self.handle.emit(AgentEvent::Reasoning {
                    agent_id: self.handle.id().to_string(),
                    content,
                }),
                ApiChunk::Usage(usage) => outcome.usage = Some(usage),
            }

            if self.handle.completion().is_some() {
                break;
            }
        }

        // End of turn: unterminated blocks count as finished.
        processor.finalize_partials();
        self.drain(&mut processor, engine, ctx, &mut outcome).await?;
        Ok(outcome)
    }

    /// Give every block of the current parse a message id, keeping the ids
    /// already handed out
    fn assign_message_ids(&self, processor: &mut BlockProcessor) {
        for index in 0..processor.blocks().len() {
            if processor.message_id(index).is_none() {
                let seq = self.message_seq.fetch_add(1, Ordering::Relaxed) + 1;
                processor.set_message_id(index, format!("{}#{}", self.handle.id(), seq));
            }
        }
    }

    fn message_id(&self, processor: &mut BlockProcessor) -> String {
        let index = processor.current_index();
        if processor.message_id(index).is_none() {
            self.assign_message_ids(processor);
        }
        processor.message_id(index).unwrap_or_default().to_string()
    }

    /// Execute finished blocks from the cursor on, one at a time
    async fn drain(
        &self,
        processor: &mut BlockProcessor,
        engine: &CommandEngine,
        ctx: &ExecutionContext,
        outcome: &mut TurnOutcome,
    ) -> Result<()> {
        if processor.check_lock() {
            return Ok(());
        }

        loop {
            if self.handle.completion().is_some() {
                return Ok(());
            }
            if self.handle.is_cancelled() {
                return Err(WeftError::Aborted);
            }
            let Some(block) = processor.current_block().cloned() else {
                return Ok(());
            };
            let index = processor.current_index();
            let message_id = self.message_id(processor);

            if block.is_partial() {
                if let Block::Text { content, .. } = block {
                    self.handle.emit(AgentEvent::Partial {
                        agent_id: self.handle.id().to_string(),
                        message_id,
                        content,
                    });
                    outcome.previewed.insert(index);
                }
                return Ok(());
            }
            let Some(guard) = processor.lock() else {
                return Ok(());
            };

            let block_ctx = ctx.clone().replacing(outcome.previewed.contains(&index));
            self.execute_block(block, message_id, engine, &block_ctx, outcome).await?;

            drop(guard);
            processor.advance();
            if !processor.should_continue(true) {
                return Ok(());
            }
        }
    }

    async fn execute_block(
        &self,
        block: Block,
        message_id: String,
        engine: &CommandEngine,
        ctx: &ExecutionContext,
        outcome: &mut TurnOutcome,
    ) -> Result<()> {
        let agent_id = self.handle.id().to_string();
        match block {
            Block::Text { content, .. } => {
                self.handle.emit(AgentEvent::Text {
                    agent_id,
                    message_id: Some(message_id),
                    content: content.clone(),
                    replacing: ctx.replacing,
                });
                outcome.text_blocks.push(content);
            }
            Block::ToolUse { name, params, .. } => {
                outcome.tool_calls += 1;
                let Some(command) = Command::from_tool_use(&name, &params) else {
                    warn!(agent = %agent_id, tool = %name, "unknown tool, nothing dispatched");
                    outcome.results.push(format!("[{}] Unknown tool; nothing was executed.", name));
                    return Ok(());
                };

                let key = command.approval_key();
                self.handle.emit(AgentEvent::CommandStarted {
                    agent_id: agent_id.clone(),
                    message_id: message_id.clone(),
                    key: key.clone(),
                    replacing: ctx.replacing,
                });
                let result = engine.run(command, ctx).await?;
                self.handle.emit(AgentEvent::CommandFinished {
                    agent_id,
                    message_id,
                    key: key.clone(),
                    result: result.clone(),
                });

                outcome.results.push(match result {
                    Some(text) => format!("[{}] Result:\n{}", key, text),
                    None => format!("[{}] Done.", key),
                });
            }
        }
        Ok(())
    }
}

/// Runs each subtask as an [`Agent`] on its own tokio task
pub struct AgentTaskSpawner {
    settings: AgentSettings,
}

impl AgentTaskSpawner {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl AgentSpawner for AgentTaskSpawner {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<()> {
        let SpawnRequest {
            child_id,
            parent_id,
            task,
            reporter,
            container,
            cancellation,
            events,
        } = request;

        let mut handle = AgentHandle::new(child_id, ConversationHistory::in_memory())
            .with_parent(parent_id, reporter)
            .with_cancellation(cancellation);
        if let Some(events) = events {
            handle = handle.with_events(events);
        }
        let agent = Agent::new(handle.clone(), container, self.settings.clone());

        tokio::spawn(async move {
            let (status, text) = match agent.run(&task).await {
                Ok(result) => (ClineStatus::Completed, result),
                Err(err) => {
                    warn!(agent = %handle.id(), error = %err, "subtask failed");
                    (ClineStatus::Error, err.user_message())
                }
            };
            // No-op when the child already reported through complete_parallel_node.
            handle.report(status, text).await;
        });
        Ok(())
    }
}
