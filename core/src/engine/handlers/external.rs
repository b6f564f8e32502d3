//! `external`: calls forwarded to whoever embeds the runtime

use async_trait::async_trait;

use crate::agent::context::ExecutionContext;
use crate::engine::{Command, CommandHandler};
use crate::services;

/// Passes the whole command to the host through the external bridge
#[derive(Debug, Default)]
pub struct ExternalHandler;

impl ExternalHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandHandler for ExternalHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let Some(bridge) = ctx.container.get_optional(&services::EXTERNAL_BRIDGE).await? else {
            return Ok(Some(format!(
                "No host is attached to handle {}.",
                command.approval_key()
            )));
        };
        let request = serde_json::to_value(command)?;
        Ok(Some(bridge.call(request).await?))
    }
}
