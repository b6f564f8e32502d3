//! Middleware wrapped around every dispatch

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info_span, Instrument};

use super::{Command, Middleware, Next};
use crate::agent::context::ExecutionContext;

/// Decides whether a command key may run without asking
pub type ApprovalPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Allow/deny key patterns; a trailing `*` matches any suffix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub auto_approve: bool,
}

impl ApprovalPolicy {
    pub fn is_allowed(&self, key: &str) -> bool {
        if self.deny.iter().any(|pattern| matches_pattern(pattern, key)) {
            return false;
        }
        self.auto_approve || self.allow.iter().any(|pattern| matches_pattern(pattern, key))
    }

    pub fn into_predicate(self) -> ApprovalPredicate {
        Arc::new(move |key| self.is_allowed(key))
    }
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

/// Redirects unapproved commands into an `askApproval` command
pub struct ApprovalMiddleware {
    predicate: ApprovalPredicate,
}

impl ApprovalMiddleware {
    pub fn new(predicate: ApprovalPredicate) -> Self {
        Self { predicate }
    }
}

#[async_trait]
impl Middleware for ApprovalMiddleware {
    async fn handle(&self, command: Command, ctx: &ExecutionContext, next: Next<'_>) -> anyhow::Result<Option<String>> {
        if ctx.approval || command.kind.is_approval_exempt() {
            return next.run(command, ctx).await;
        }

        let key = command.approval_key();
        if (self.predicate)(&key) {
            return next.run(command, ctx).await;
        }

        debug!(command = %key, "approval required");
        next.run(command.ask_approval(), ctx).await
    }
}

/// One span per dispatched command
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(&self, command: Command, ctx: &ExecutionContext, next: Next<'_>) -> anyhow::Result<Option<String>> {
        let key = command.approval_key();
        let span = info_span!("command", command.key = %key, agent = %ctx.agent.id());
        let started = Instant::now();

        let result = next.run(command, ctx).instrument(span.clone()).await;

        let _entered = span.enter();
        match &result {
            Ok(output) => debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                result_len = output.as_ref().map_or(0, String::len),
                "command finished"
            ),
            Err(err) => debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "command errored"
            ),
        }
        result
    }
}
