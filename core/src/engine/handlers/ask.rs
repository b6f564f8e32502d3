//! Handlers that talk to the human operator

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::agent::context::ExecutionContext;
use crate::engine::{Command, CommandHandler};
use crate::services;
use crate::tools::UserPrompt;

#[derive(Debug, Deserialize)]
struct Question {
    #[serde(alias = "content")]
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

/// Free-form question to the user
pub struct AskHandler {
    prompt: Arc<dyn UserPrompt>,
}

impl AskHandler {
    pub fn new(prompt: Arc<dyn UserPrompt>) -> Self {
        Self { prompt }
    }
}

#[async_trait]
impl CommandHandler for AskHandler {
    async fn execute(&self, command: &Command, _ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let Question { question, options } = command.parse_op()?;
        let answer = self.prompt.ask(&question, &options).await?;
        Ok(Some(format!("User answered: {}", answer)))
    }
}

/// Yes/no question raised by the model itself
pub struct ApprovalHandler {
    prompt: Arc<dyn UserPrompt>,
}

impl ApprovalHandler {
    pub fn new(prompt: Arc<dyn UserPrompt>) -> Self {
        Self { prompt }
    }
}

#[async_trait]
impl CommandHandler for ApprovalHandler {
    async fn execute(&self, command: &Command, _ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let Question { question, .. } = command.parse_op()?;
        let answer = if self.prompt.confirm(&question).await? {
            "User approved."
        } else {
            "User declined."
        };
        Ok(Some(answer.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct PendingApproval {
    key: String,
    original: Command,
}

/// Gate inserted by the approval middleware.
///
/// On consent the original command runs again with the gate bypassed.
pub struct AskApprovalHandler {
    prompt: Arc<dyn UserPrompt>,
}

impl AskApprovalHandler {
    pub fn new(prompt: Arc<dyn UserPrompt>) -> Self {
        Self { prompt }
    }
}

fn describe(command: &Command) -> String {
    let details: Vec<String> = command
        .fields
        .iter()
        .map(|(key, value)| match value.as_str() {
            Some(text) => format!("  {}: {}", key, text),
            None => format!("  {}: {}", key, value),
        })
        .collect();
    details.join("\n")
}

#[async_trait]
impl CommandHandler for AskApprovalHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let PendingApproval { key, original } = command
            .parse_op()
            .context("askApproval needs the original command")?;

        let message = format!("Allow {}?\n{}", key, describe(&original));
        if !self.prompt.confirm(&message).await? {
            info!(command = %key, "user denied command");
            return Ok(Some(format!("User denied permission to run {}.", key)));
        }

        info!(command = %key, "user approved command");
        let engine = ctx.container.get(&services::COMMAND_ENGINE).await?;
        engine.execute(original, &ctx.approved()).await
    }
}
