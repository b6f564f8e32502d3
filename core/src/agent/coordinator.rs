//! Parallel task coordinator
//!
//! Fans subtasks out as child agents, then waits on a channel scoped to
//! this one fan-out until every child has reported. The channel is dropped
//! when the wait ends, so late reports go nowhere.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::{AgentEvent, ExecutionContext};
use crate::container::Container;
use crate::error::WeftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClineStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ClineStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ClineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// One spawned subtask
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClineIdentifier {
    pub task: String,
    pub id: String,
    pub status: ClineStatus,
}

/// Message a child sends to its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub child_id: String,
    pub status: ClineStatus,
    pub text: String,
}

/// Everything needed to start one child agent
pub struct SpawnRequest {
    pub child_id: String,
    pub parent_id: String,
    pub task: String,
    pub reporter: mpsc::Sender<StatusReport>,
    pub container: Arc<Container>,
    /// Cancelled together with the parent
    pub cancellation: CancellationToken,
    /// Parent's event channel, shared so the operator sees child progress
    pub events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

/// Starts child agents; the child must send exactly one report
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<()>;
}

pub struct ParallelCoordinator {
    spawner: Arc<dyn AgentSpawner>,
}

impl ParallelCoordinator {
    pub fn new(spawner: Arc<dyn AgentSpawner>) -> Self {
        Self { spawner }
    }

    /// Run every task as a child agent and return their reports, in
    /// arrival order, once none is still running.
    pub async fn run_parallel(&self, tasks: Vec<String>, ctx: &ExecutionContext) -> anyhow::Result<String> {
        if tasks.is_empty() {
            return Ok("No subtasks were given.".to_string());
        }

        let parent = &ctx.agent;
        let (reporter, mut reports) = mpsc::channel(tasks.len());
        let mut children = Vec::with_capacity(tasks.len());
        let mut segments = Vec::with_capacity(tasks.len());
        let mut running = 0usize;

        for task in tasks {
            let id = format!("{}-{}", parent.id(), &Uuid::new_v4().simple().to_string()[..8]);
            let request = SpawnRequest {
                child_id: id.clone(),
                parent_id: parent.id().to_string(),
                task: task.clone(),
                reporter: reporter.clone(),
                container: ctx.container.clone(),
                cancellation: parent.cancellation().child_token(),
                events: parent.events().cloned(),
            };

            let status = match self.spawner.spawn(request).await {
                Ok(()) => {
                    running += 1;
                    ClineStatus::Running
                }
                Err(err) => {
                    warn!(child = %id, error = %err, "failed to spawn subtask");
                    segments.push(format!("[{}] {}: failed to start: {:#}", id, ClineStatus::Error, err));
                    ClineStatus::Error
                }
            };
            children.push(ClineIdentifier { task, id, status });
        }
        // Only children hold senders now; a closed channel means they are all gone.
        drop(reporter);

        let listing: Vec<String> = children
            .iter()
            .map(|child| format!("- {} ({}): {}", child.id, child.status, child.task))
            .collect();
        parent.progress(format!(
            "Started {} subtasks:\n{}",
            running,
            listing.join("\n")
        ));
        info!(agent = %parent.id(), children = running, "waiting for subtasks");

        while running > 0 {
            let report = tokio::select! {
                _ = parent.cancellation().cancelled() => {
                    return Err(WeftError::Aborted.into());
                }
                report = reports.recv() => report,
            };
            let Some(report) = report else {
                warn!(agent = %parent.id(), running, "subtasks exited without reporting");
                segments.push(format!("{} subtasks ended without a report.", running));
                break;
            };

            let Some(child) = children.iter_mut().find(|child| child.id == report.child_id) else {
                warn!(child = %report.child_id, "report from unknown subtask");
                continue;
            };
            if child.status.is_running() && !report.status.is_running() {
                running -= 1;
            }
            child.status = report.status;
            debug!(child = %child.id, status = %child.status, running, "subtask reported");
            segments.push(format!("[{}] {}: {}", child.id, report.status, report.text));
        }

        Ok(segments.join("\n\n"))
    }
}
