//! `weft run`: one task in the foreground

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use console::Style;
use tokio::sync::mpsc;
use tracing::info;
use weft_core::agent::{AgentHandle, ConversationHistory};
use weft_core::{bootstrap, Agent, WeftConfig};

use super::prompt::TerminalPrompt;
use super::{local_collaborators, render};

pub async fn handle_run(mut config: WeftConfig, task: &str, auto_approve: bool, fresh: bool) -> Result<()> {
    if auto_approve {
        config.agent.auto_approve = true;
    }

    let settings = config.runtime_settings();
    let agent_settings = settings.agent.clone();
    let collaborators = local_collaborators(&config, Arc::new(TerminalPrompt::new()), None)?;
    let container = bootstrap(collaborators, settings).context("Failed to wire runtime services")?;

    let history = match config.history_path() {
        Some(path) => {
            if fresh {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!(path = %path.display(), "cleared saved conversation"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err).context("Failed to clear saved conversation"),
                }
            }
            ConversationHistory::open(&path)
                .await
                .with_context(|| format!("Failed to open conversation {}", path.display()))?
        }
        None => ConversationHistory::in_memory(),
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let handle = AgentHandle::new("root", history).with_events(events_tx);
    let agent = Agent::new(handle.clone(), container, agent_settings);

    let run = agent.run(task);
    tokio::pin!(run);
    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => render::print_event(&event),
            outcome = &mut run => break outcome,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nAborting after the current command…");
                handle.abort();
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        render::print_event(&event);
    }

    match outcome {
        Ok(result) => {
            println!("\n{}", Style::new().green().bold().apply_to("Done"));
            if !result.trim().is_empty() {
                println!("{}", result);
            }
            Ok(())
        }
        Err(err) => bail!(err.user_message()),
    }
}
