//! `weft worker`: envelope server on stdin/stdout

use std::sync::Arc;

use anyhow::{Context, Result};
use weft_core::ipc::Worker;
use weft_core::tools::ExternalBridge;
use weft_core::{bootstrap, WeftConfig};

use super::local_collaborators;

pub async fn handle_worker(config: &WeftConfig) -> Result<()> {
    let worker = Worker::new();
    let link = worker.link();

    // Questions and external calls go to whoever spawned us.
    let collaborators = local_collaborators(config, link.clone(), Some(link as Arc<dyn ExternalBridge>))?;
    let settings = config.runtime_settings();
    let agent_settings = settings.agent.clone();
    let container = bootstrap(collaborators, settings).context("Failed to wire runtime services")?;

    worker
        .serve(tokio::io::stdin(), tokio::io::stdout(), container, agent_settings)
        .await
        .context("Worker channel failed")
}
