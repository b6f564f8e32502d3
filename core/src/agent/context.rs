//! Agent handle and per-block execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::coordinator::{ClineStatus, StatusReport};
use super::history::ConversationHistory;
use crate::container::Container;
use crate::engine::handlers::PlanStep;
use crate::tools::ToolHub;

/// Events published by a running agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Block still streaming; later events with the same `message_id`
    /// replace it
    Partial {
        agent_id: String,
        message_id: String,
        content: String,
    },
    /// Finished prose block; `message_id` is `None` for `base.log` output
    Text {
        agent_id: String,
        message_id: Option<String>,
        content: String,
        /// A partial rendering of this message was already emitted
        replacing: bool,
    },
    Reasoning { agent_id: String, content: String },
    /// Status line that is not part of the conversation
    Progress { agent_id: String, message: String },
    CommandStarted {
        agent_id: String,
        message_id: String,
        key: String,
        replacing: bool,
    },
    CommandFinished {
        agent_id: String,
        message_id: String,
        key: String,
        result: Option<String>,
    },
    Completed { agent_id: String, result: String },
    Failed { agent_id: String, message: String },
}

/// Shared handle on one running agent instance
#[derive(Clone)]
pub struct AgentHandle {
    id: String,
    parent_id: Option<String>,
    history: Arc<tokio::sync::Mutex<ConversationHistory>>,
    cancellation: CancellationToken,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    completion: Arc<Mutex<Option<String>>>,
    reporter: Option<mpsc::Sender<StatusReport>>,
    reported: Arc<AtomicBool>,
    /// Empty until the agent creates a plan
    plan: Arc<Mutex<Vec<PlanStep>>>,
}

impl AgentHandle {
    pub fn new(id: impl Into<String>, history: ConversationHistory) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            history: Arc::new(tokio::sync::Mutex::new(history)),
            cancellation: CancellationToken::new(),
            events: None,
            completion: Arc::new(Mutex::new(None)),
            reporter: None,
            reported: Arc::new(AtomicBool::new(false)),
            plan: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Mark this agent as a child reporting to `parent_id`
    pub fn with_parent(mut self, parent_id: impl Into<String>, reporter: mpsc::Sender<StatusReport>) -> Self {
        self.parent_id = Some(parent_id.into());
        self.reporter = Some(reporter);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn history(&self) -> &Arc<tokio::sync::Mutex<ConversationHistory>> {
        &self.history
    }

    pub fn events(&self) -> Option<&mpsc::UnboundedSender<AgentEvent>> {
        self.events.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Request a cooperative stop; checked between blocks
    pub fn abort(&self) {
        debug!(agent = %self.id, "abort requested");
        self.cancellation.cancel();
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.emit(AgentEvent::Progress {
            agent_id: self.id.clone(),
            message: message.into(),
        });
    }

    pub fn plan(&self) -> &Arc<Mutex<Vec<PlanStep>>> {
        &self.plan
    }

    pub fn mark_complete(&self, result: impl Into<String>) {
        *self.completion.lock() = Some(result.into());
    }

    pub fn completion(&self) -> Option<String> {
        self.completion.lock().clone()
    }

    pub fn has_reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }

    /// Send this child's single status report to its parent.
    ///
    /// Returns false when there is no parent or a report was already sent.
    pub async fn report(&self, status: ClineStatus, text: impl Into<String>) -> bool {
        let Some(reporter) = &self.reporter else {
            return false;
        };
        if self.reported.swap(true, Ordering::SeqCst) {
            return false;
        }
        let report = StatusReport {
            child_id: self.id.clone(),
            status,
            text: text.into(),
        };
        if reporter.send(report).await.is_err() {
            warn!(agent = %self.id, "parent stopped listening before report");
            return false;
        }
        true
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Everything a command handler may touch while one block executes
#[derive(Clone)]
pub struct ExecutionContext {
    pub agent: AgentHandle,
    pub container: Arc<Container>,
    pub hub: Option<Arc<dyn ToolHub>>,
    /// Overwrite the in-flight message instead of appending a new one
    pub replacing: bool,
    /// Already cleared the approval gate
    pub approval: bool,
}

impl ExecutionContext {
    pub fn new(agent: AgentHandle, container: Arc<Container>) -> Self {
        Self {
            agent,
            container,
            hub: None,
            replacing: false,
            approval: false,
        }
    }

    pub fn with_hub(mut self, hub: Option<Arc<dyn ToolHub>>) -> Self {
        self.hub = hub;
        self
    }

    pub fn replacing(mut self, replacing: bool) -> Self {
        self.replacing = replacing;
        self
    }

    /// Copy of this context that bypasses the approval gate
    pub fn approved(&self) -> Self {
        Self {
            approval: true,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("agent", &self.agent)
            .field("hub", &self.hub.is_some())
            .field("replacing", &self.replacing)
            .field("approval", &self.approval)
            .finish()
    }
}
