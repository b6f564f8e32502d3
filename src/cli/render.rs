//! Terminal rendering of agent events

use console::Style;
use weft_core::agent::AgentEvent;

/// First line of a command result, for the one-line summary
fn summary(result: &str) -> String {
    let first = result.lines().next().unwrap_or_default();
    let more = result.lines().count() > 1;
    let mut line: String = first.chars().take(100).collect();
    if more || first.chars().count() > 100 {
        line.push_str(" …");
    }
    line
}

pub fn print_event(event: &AgentEvent) {
    let dim = Style::new().dim();
    match event {
        AgentEvent::Text { content, .. } => println!("{}", content),
        AgentEvent::Reasoning { content, .. } => println!("{}", dim.apply_to(content)),
        AgentEvent::Progress { agent_id, message } => {
            println!("{} {}", Style::new().cyan().apply_to(format!("[{}]", agent_id)), message)
        }
        AgentEvent::CommandStarted { agent_id, key, .. } => {
            println!("{} {} {}", Style::new().yellow().apply_to("→"), key, dim.apply_to(agent_id))
        }
        AgentEvent::CommandFinished { result, .. } => {
            if let Some(result) = result {
                println!("  {}", dim.apply_to(summary(result)));
            }
        }
        // Line output only shows finished blocks; the final result is
        // printed by the caller.
        AgentEvent::Partial { .. } | AgentEvent::Completed { .. } => {}
        AgentEvent::Failed { agent_id, message } => {
            eprintln!("{} {}", Style::new().red().apply_to(format!("[{}] failed:", agent_id)), message)
        }
    }
}
