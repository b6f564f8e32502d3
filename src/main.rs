//! `weft` - an autonomous coding agent for the terminal
//!
//! The model acts through yaml tool calls that are parsed while the
//! response streams and executed one at a time against the current
//! directory.

use anyhow::{Context, Result};
use clap::Parser;

use crate::cli::{Cli, Commands};
use weft_core::WeftConfig;

mod cli;
mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WeftConfig::load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init(config.log_level.as_deref());

    match &cli.command {
        Commands::Run {
            task,
            auto_approve,
            fresh,
        } => cli::run::handle_run(config, &task.join(" "), *auto_approve, *fresh).await,
        Commands::Worker => cli::worker::handle_worker(&config).await,
        Commands::Supervise { task } => {
            cli::supervise::handle_supervise(&config, cli.config.as_deref(), &task.join(" ")).await
        }
        Commands::Config { cmd } => cli::config::handle_config(cmd, &config, cli.config.as_deref()),
    }
}
