//! `base.*`: log, think, plan notes and task completion

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::agent::context::{AgentEvent, ExecutionContext};
use crate::agent::coordinator::ClineStatus;
use crate::engine::{Command, CommandHandler};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BaseOp {
    Log {
        #[serde(default)]
        content: String,
    },
    Think {
        #[serde(default)]
        content: String,
    },
    Plan {
        #[serde(default)]
        content: String,
    },
    Complete {
        #[serde(default, alias = "result")]
        content: String,
    },
    CompleteParallelNode {
        #[serde(default, alias = "result")]
        content: String,
    },
}

/// Narration, reasoning and completion signals
#[derive(Debug, Default)]
pub struct BaseHandler;

impl BaseHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandHandler for BaseHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let agent = &ctx.agent;
        match command.parse_op::<BaseOp>()? {
            BaseOp::Log { content } => {
                agent.emit(AgentEvent::Text {
                    agent_id: agent.id().to_string(),
                    message_id: None,
                    content,
                    replacing: false,
                });
                Ok(None)
            }
            BaseOp::Think { content } => {
                debug!(agent = %agent.id(), "thinking");
                agent.emit(AgentEvent::Reasoning {
                    agent_id: agent.id().to_string(),
                    content,
                });
                Ok(None)
            }
            BaseOp::Plan { content } => {
                agent.progress(content);
                Ok(None)
            }
            BaseOp::Complete { content } => {
                info!(agent = %agent.id(), "task completed");
                agent.mark_complete(content);
                Ok(None)
            }
            BaseOp::CompleteParallelNode { content } => {
                if agent.parent_id().is_none() {
                    return Ok(Some(
                        "This agent has no parent agent; use complete to finish the task.".to_string(),
                    ));
                }
                let delivered = agent.report(ClineStatus::Completed, content.clone()).await;
                agent.mark_complete(content);
                if delivered {
                    Ok(Some("Reported result to the parent agent.".to_string()))
                } else {
                    Ok(Some("A report was already sent to the parent agent.".to_string()))
                }
            }
        }
    }
}
