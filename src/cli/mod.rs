//! CLI argument parsing using clap 4.x derive macros

pub mod config;
pub mod prompt;
pub mod render;
pub mod run;
pub mod supervise;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use weft_core::llm::OpenAiHandler;
use weft_core::tools::{ExternalBridge, InMemoryStore, LocalFileOps, ShellRunner, UserPrompt};
use weft_core::{Collaborators, WeftConfig};

/// An autonomous coding agent for the terminal
///
/// Works with OpenAI-compatible endpoints (OpenAI, Ollama, LM Studio,
/// OpenRouter) and acts on the current directory through tool calls.
#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task in this terminal
    Run {
        /// What the agent should do
        #[arg(num_args = 1.., required = true)]
        task: Vec<String>,

        /// Run every command without asking
        #[arg(short = 'y', long)]
        auto_approve: bool,

        /// Start from an empty conversation instead of the saved one
        #[arg(long)]
        fresh: bool,
    },

    /// Serve tasks over stdin/stdout envelopes (spawned by `supervise`)
    #[command(hide = true)]
    Worker,

    /// Run a task in a restarting worker process
    Supervise {
        /// What the agent should do
        #[arg(num_args = 1.., required = true)]
        task: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the default config file location
    Path,
    /// Print the effective configuration
    Show,
    /// Write a default config file if none exists
    Init,
}

/// Local implementations of every collaborator the runtime needs
pub fn local_collaborators(
    config: &WeftConfig,
    prompt: Arc<dyn UserPrompt>,
    external: Option<Arc<dyn ExternalBridge>>,
) -> Result<Collaborators> {
    let api = OpenAiHandler::new(config.openai_settings()).context("Failed to create model client")?;
    let root = std::env::current_dir().context("Failed to resolve the working directory")?;

    Ok(Collaborators {
        api: Arc::new(api),
        file_ops: Arc::new(LocalFileOps::new(root)),
        code_runner: Arc::new(ShellRunner::new()),
        prompt,
        memory: Arc::new(InMemoryStore::new()),
        browser: None,
        hub: None,
        external,
    })
}
