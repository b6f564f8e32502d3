//! Per-domain command handlers
//!
//! Each handler maps its command's sub-discriminant to one collaborator
//! call. Collaborators that may be absent (browser, hub, external bridge)
//! are looked up at execution time.

mod advance;
mod ask;
mod base;
mod browser;
mod coder;
mod external;
mod file;
mod mcp;
mod plan;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use advance::AdvanceHandler;
pub use ask::{ApprovalHandler, AskApprovalHandler, AskHandler};
pub use base::BaseHandler;
pub use browser::BrowserHandler;
pub use coder::CoderHandler;
pub use external::ExternalHandler;
pub use file::FileHandler;
pub use mcp::McpHandler;
pub use plan::{PlanHandler, PlanStep, StepStatus};

use crate::agent::context::AgentHandle;
use crate::tools::{DownloadProgress, ProgressFn};

/// Progress callback that reports every tenth percent to the agent's events
fn download_progress(agent: &AgentHandle, label: String) -> ProgressFn {
    let agent = agent.clone();
    let last_step = AtomicU8::new(0);
    Arc::new(move |progress: DownloadProgress| {
        let Some(percent) = progress.percent() else {
            return;
        };
        let step = percent / 10;
        if step > last_step.swap(step, Ordering::SeqCst) {
            agent.progress(format!("Downloading {}: {}%", label, percent));
        }
    })
}

fn or_no_output(output: String) -> String {
    if output.trim().is_empty() {
        "(no output)".to_string()
    } else {
        output
    }
}
