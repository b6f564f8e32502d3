//! Command execution engine
//!
//! One handler per command type, resolved lazily through the container and
//! wrapped in an ordered middleware chain.
//!
//! ```text
//! run(command)
//!   ├─ no handler for type ─────────────► warn, no result
//!   ├─ <var historyId=N/> substitution in `content`
//!   ├─ middleware[0] → middleware[1] → … → dispatch(handler)
//!   │                                         └─ Err ─► "Error executing <key>: …"
//!   └─ truncate to the result cap
//! ```

pub mod command;
pub mod handlers;
pub mod middleware;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{error, warn};

use crate::agent::context::ExecutionContext;
use crate::container::{ContainerError, ServiceToken};
use crate::error::Result;

pub use command::{Command, CommandType};
pub use middleware::{ApprovalMiddleware, ApprovalPolicy, TracingMiddleware};

/// Default cap on characters fed back from one command
pub const DEFAULT_RESULT_CAP: usize = 20_000;

lazy_static! {
    static ref VAR_RE: Regex =
        Regex::new(r#"<var\s+historyId\s*=\s*["']?(\d+)["']?\s*/>"#).expect("valid regex");
}

/// Executes one command type
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>>;
}

/// Handlers are container services behind this token type
pub type HandlerToken = ServiceToken<Arc<dyn CommandHandler>>;

/// Wraps every dispatch
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, command: Command, ctx: &ExecutionContext, next: Next<'_>) -> anyhow::Result<Option<String>>;
}

/// Remainder of the middleware chain
pub struct Next<'a> {
    engine: &'a CommandEngine,
    remaining: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, command: Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        match self.remaining.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    engine: self.engine,
                    remaining: rest,
                };
                current.handle(command, ctx, next).await
            }
            None => self.engine.dispatch(command, ctx).await,
        }
    }
}

/// Registry of handlers plus the middleware chain
pub struct CommandEngine {
    handlers: HashMap<CommandType, HandlerToken>,
    middleware: Vec<Arc<dyn Middleware>>,
    result_cap: usize,
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandEngine {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            middleware: Vec::new(),
            result_cap: DEFAULT_RESULT_CAP,
        }
    }

    pub fn with_result_cap(mut self, cap: usize) -> Self {
        self.result_cap = cap;
        self
    }

    /// Associate a command type with its handler service; last one wins
    pub fn register(&mut self, kind: CommandType, handler: HandlerToken) {
        self.handlers.insert(kind, handler);
    }

    /// Append to the chain; the first added runs outermost
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn handles(&self, kind: CommandType) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn result_cap(&self) -> usize {
        self.result_cap
    }

    /// Run a command to its textual result.
    ///
    /// Only wiring mistakes come back as errors; handler failures become
    /// the result text.
    pub async fn run(&self, command: Command, ctx: &ExecutionContext) -> Result<Option<String>> {
        if !self.handles(command.kind) {
            warn!(command = %command.approval_key(), "no handler registered, ignoring command");
            return Ok(None);
        }

        let key = command.approval_key();
        match self.execute(command, ctx).await {
            Ok(result) => Ok(result.map(|text| truncate_result(&text, self.result_cap))),
            Err(err) => match err.downcast::<ContainerError>() {
                Ok(wiring) => {
                    error!(command = %key, error = %wiring, "handler could not be resolved");
                    Err(wiring.into())
                }
                Err(other) => Ok(Some(truncate_result(
                    &format!("Error executing {}: {:#}", key, other),
                    self.result_cap,
                ))),
            },
        }
    }

    /// Interpolate, then run through the chain without capping
    pub async fn execute(&self, mut command: Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        self.interpolate(&mut command, ctx).await;
        Next {
            engine: self,
            remaining: &self.middleware,
        }
        .run(command, ctx)
        .await
    }

    async fn interpolate(&self, command: &mut Command, ctx: &ExecutionContext) {
        let Some(Value::String(content)) = command.fields.get("content") else {
            return;
        };
        if !VAR_RE.is_match(content) {
            return;
        }

        let history = ctx.agent.history().lock().await;
        let replaced = VAR_RE
            .replace_all(content, |caps: &Captures| {
                let entry = caps[1]
                    .parse::<u64>()
                    .ok()
                    .and_then(|id| history.get_by_history_id(id));
                match entry {
                    Some(item) => item.text().to_string(),
                    None => {
                        warn!(reference = &caps[0], "variable references unknown history entry");
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();
        drop(history);

        command.fields.insert("content".to_string(), Value::String(replaced));
    }

    /// Handler-wrapper boundary: handler errors become result text
    async fn dispatch(&self, command: Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let Some(token) = self.handlers.get(&command.kind) else {
            warn!(command = %command.approval_key(), "no handler registered, ignoring command");
            return Ok(None);
        };
        let handler = ctx.container.get(token).await?;

        match handler.execute(&command, ctx).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(command = %command.approval_key(), error = %err, "command failed");
                Ok(Some(format!("Error executing {}: {:#}", command.approval_key(), err)))
            }
        }
    }
}

/// Cap `text` at `cap` characters, noting how much was dropped
pub fn truncate_result(text: &str, cap: usize) -> String {
    let total = text.chars().count();
    if total <= cap {
        return text.to_string();
    }
    let kept: String = text.chars().take(cap).collect();
    format!("{}...({} characters omitted)", kept, total - cap)
}
