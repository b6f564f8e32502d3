//! `plan.*`: a checklist kept on the running agent

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::context::ExecutionContext;
use crate::engine::{Command, CommandHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Skipped,
}

impl StepStatus {
    fn label(&self) -> &'static str {
        match self {
            Self::Pending => " ",
            Self::InProgress => "~",
            Self::Done => "x",
            Self::Skipped => "-",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum PlanOp {
    Create { steps: Vec<String> },
    /// `step` is 1-based, as rendered
    Update { step: usize, status: StepStatus },
    Show,
}

/// Structured task plans; each agent's plan lives on its handle
#[derive(Debug, Default)]
pub struct PlanHandler;

impl PlanHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

fn render(steps: &[PlanStep]) -> String {
    let done = steps.iter().filter(|step| step.status == StepStatus::Done).count();
    let mut out = format!("Plan ({}/{} done):", done, steps.len());
    for (index, step) in steps.iter().enumerate() {
        out.push_str(&format!("\n{}. [{}] {}", index + 1, step.status.label(), step.description));
    }
    out
}

#[async_trait]
impl CommandHandler for PlanHandler {
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let mut plan = ctx.agent.plan().lock();

        let rendered = match command.parse_op::<PlanOp>()? {
            PlanOp::Create { steps } => {
                if steps.is_empty() {
                    bail!("a plan needs at least one step");
                }
                let steps: Vec<PlanStep> = steps
                    .into_iter()
                    .map(|description| PlanStep {
                        description,
                        status: StepStatus::Pending,
                    })
                    .collect();
                let rendered = render(&steps);
                *plan = steps;
                rendered
            }
            PlanOp::Update { step, status } => {
                if plan.is_empty() {
                    bail!("no plan exists yet; create one first");
                }
                let count = plan.len();
                let Some(target) = step.checked_sub(1).and_then(|index| plan.get_mut(index)) else {
                    bail!("step {} does not exist (plan has {} steps)", step, count);
                };
                target.status = status;
                render(&plan)
            }
            PlanOp::Show if plan.is_empty() => "No plan yet.".to_string(),
            PlanOp::Show => render(&plan),
        };
        drop(plan);

        ctx.agent.progress(rendered.clone());
        Ok(Some(rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::AgentHandle;
    use crate::agent::history::ConversationHistory;
    use crate::container::Container;
    use crate::engine::handlers::testing;
    use crate::engine::CommandType;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_update_show() {
        let handler = PlanHandler::new();
        let (ctx, _events) = testing::context(Container::new());

        let show = Command::new(CommandType::Plan).with("cmd", "show");
        assert_eq!(handler.execute(&show, &ctx).await.unwrap().as_deref(), Some("No plan yet."));

        let create = Command::new(CommandType::Plan)
            .with("cmd", "create")
            .with("steps", json!(["read code", "fix bug"]));
        handler.execute(&create, &ctx).await.unwrap();

        let update = Command::new(CommandType::Plan)
            .with("cmd", "update")
            .with("step", 1)
            .with("status", "done");
        let rendered = handler.execute(&update, &ctx).await.unwrap().unwrap();
        assert_eq!(rendered, "Plan (1/2 done):\n1. [x] read code\n2. [ ] fix bug");

        let bad = Command::new(CommandType::Plan)
            .with("cmd", "update")
            .with("step", 0)
            .with("status", "done");
        assert!(handler.execute(&bad, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_plans_are_per_agent() {
        let handler = PlanHandler::new();
        let (root, _root_events) = testing::context(Container::new());
        let child = ExecutionContext::new(
            AgentHandle::new("root-1a2b3c4d", ConversationHistory::in_memory()),
            root.container.clone(),
        );

        let create = Command::new(CommandType::Plan)
            .with("cmd", "create")
            .with("steps", json!(["split work"]));
        handler.execute(&create, &child).await.unwrap();
        assert_eq!(child.agent.plan().lock().len(), 1);

        let show = Command::new(CommandType::Plan).with("cmd", "show");
        assert_eq!(handler.execute(&show, &root).await.unwrap().as_deref(), Some("No plan yet."));

        // Dropping the child's handle drops its plan with it.
        let plan = std::sync::Arc::downgrade(child.agent.plan());
        drop(child);
        assert!(plan.upgrade().is_none());
    }
}
