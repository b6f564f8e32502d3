//! `mcp.*`: tools served by an external hub

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::agent::context::ExecutionContext;
use crate::engine::{Command, CommandHandler};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum McpOp {
    List,
    ListTool {
        server: String,
    },
    CallTool {
        server: String,
        tool: String,
        #[serde(default, alias = "args")]
        arguments: Value,
    },
}

/// External tool hub access through `ctx.hub`
#[derive(Debug, Default)]
pub struct McpHandler;

impl McpHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandHandler for McpHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let op: McpOp = command.parse_op()?;
        let Some(hub) = &ctx.hub else {
            return Ok(Some("No external tool hub is connected.".to_string()));
        };

        let output = match op {
            McpOp::List => {
                let servers = hub.list_servers().await?;
                if servers.is_empty() {
                    "No servers configured.".to_string()
                } else {
                    servers.join("\n")
                }
            }
            McpOp::ListTool { server } => {
                let tools = hub.list_tools(&server).await?;
                if tools.is_empty() {
                    format!("Server {} exposes no tools.", server)
                } else {
                    tools
                        .iter()
                        .map(|tool| format!("- {}: {}", tool.name, tool.description))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            McpOp::CallTool { server, tool, arguments } => {
                let arguments = match arguments {
                    Value::Null => Value::Object(Map::new()),
                    other => other,
                };
                hub.call_tool(&server, &tool, arguments).await?
            }
        };
        Ok(Some(output))
    }
}
