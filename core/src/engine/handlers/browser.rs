//! `browser.*`: delegated to the optional browser collaborator

use async_trait::async_trait;

use super::download_progress;
use crate::agent::context::ExecutionContext;
use crate::engine::{Command, CommandHandler};
use crate::services;
use crate::tools::BrowserAction;

/// Forwards `browser.*` actions to the browser collaborator, if one exists
#[derive(Debug, Default)]
pub struct BrowserHandler;

impl BrowserHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandHandler for BrowserHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let action: BrowserAction = command.parse_op()?;
        let Some(browser) = ctx.container.get_optional(&services::BROWSER).await? else {
            return Ok(Some(format!(
                "Browser automation is not available in this runtime; '{}' was not performed.",
                action.name()
            )));
        };

        let progress = match &action {
            BrowserAction::Download { path, .. } => Some(download_progress(&ctx.agent, path.clone())),
            _ => None,
        };
        Ok(Some(browser.perform(action, progress).await?))
    }
}
