//! `weft supervise`: run a task in a worker process that is restarted
//! when it crashes

use std::path::Path;

use anyhow::{bail, Context, Result};
use console::Style;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_core::agent::AgentEvent;
use weft_core::ipc::{kinds, Envelope, RequestTracker, SupervisorEvent, WorkerCommand, WorkerSupervisor};
use weft_core::tools::UserPrompt;
use weft_core::WeftConfig;

use super::prompt::TerminalPrompt;
use super::render;

#[derive(Deserialize)]
struct AskPayload {
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Deserialize)]
struct ConfirmPayload {
    message: String,
}

fn send(inbound: &Option<mpsc::UnboundedSender<Envelope>>, envelope: Envelope) {
    match inbound {
        Some(inbound) if inbound.send(envelope).is_ok() => {}
        _ => debug!("worker channel already closed"),
    }
}

pub async fn handle_supervise(config: &WeftConfig, config_path: Option<&Path>, task: &str) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the weft binary")?;
    let mut command = WorkerCommand::new(exe.to_string_lossy()).arg("worker");
    if let Some(path) = config_path {
        command = command.arg("--config").arg(path.to_string_lossy());
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let supervisor = WorkerSupervisor::new(command, config.supervisor.clone(), events_tx);
    let supervisor_task = tokio::spawn(supervisor.run(inbound, CancellationToken::new()));

    let tracker = RequestTracker::new("p");
    let (request, mut reply) = tracker.request(kinds::RUN_TASK, json!({"task": task}));
    let request_id = request.request_id.clone().unwrap_or_default();
    let prompt = TerminalPrompt::new();
    let mut inbound = Some(inbound_tx);
    let mut outcome: Option<Envelope> = None;
    let mut finished = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    SupervisorEvent::Started { restarts, pid } => {
                        debug!(restarts, ?pid, "worker up");
                        // A restarted worker has lost the run; hand it over again.
                        if tracker.is_pending(&request_id) {
                            send(&inbound, request.clone());
                        }
                    }
                    SupervisorEvent::Message(envelope) => {
                        handle_message(envelope, &tracker, &prompt, &inbound).await;
                    }
                    SupervisorEvent::Exited { code } => debug!(?code, "worker exited"),
                    SupervisorEvent::Restarting { attempt, delay } => eprintln!(
                        "{} worker crashed, restart {} in {:?}",
                        Style::new().yellow().apply_to("!"),
                        attempt,
                        delay
                    ),
                    SupervisorEvent::GaveUp { attempts } => eprintln!(
                        "{} worker failed {} times, giving up",
                        Style::new().red().apply_to("✗"),
                        attempts
                    ),
                }
            }
            received = &mut reply, if !finished => {
                finished = true;
                outcome = received.ok();
                // EOF on its stdin lets the worker shut down cleanly.
                inbound = None;
            }
            _ = tokio::signal::ctrl_c(), if !finished => {
                eprintln!("\nAborting after the current command…");
                send(&inbound, Envelope::new(kinds::ABORT).with_payload(json!({"target": request_id})));
            }
        }
    }

    let supervised = supervisor_task.await.context("Supervisor task panicked")?;
    match outcome {
        Some(envelope) if envelope.kind == kinds::TASK_RESULT => {
            let result = envelope
                .payload
                .as_ref()
                .and_then(|payload| payload.get("result"))
                .and_then(|result| result.as_str())
                .unwrap_or_default();
            println!("\n{}", Style::new().green().bold().apply_to("Done"));
            if !result.trim().is_empty() {
                println!("{}", result);
            }
            Ok(())
        }
        Some(envelope) => bail!(envelope.error_message().unwrap_or("the task failed").to_string()),
        None => {
            supervised.context("Worker supervision failed")?;
            bail!("The worker stopped before finishing the task")
        }
    }
}

async fn handle_message(
    envelope: Envelope,
    tracker: &RequestTracker,
    prompt: &TerminalPrompt,
    inbound: &Option<mpsc::UnboundedSender<Envelope>>,
) {
    match envelope.kind.as_str() {
        kinds::EVENT => match envelope.payload_as::<AgentEvent>() {
            Ok(event) => render::print_event(&event),
            Err(err) => warn!(error = %err, "undecodable agent event"),
        },
        kinds::ASK => {
            let payload = match envelope.payload_as::<AskPayload>() {
                Ok(ask) => match prompt.ask(&ask.question, &ask.options).await {
                    Ok(answer) => json!({"answer": answer}),
                    Err(err) => json!({"error": err.to_string()}),
                },
                Err(err) => json!({"error": err.to_string()}),
            };
            send(inbound, envelope.reply(kinds::RESPONSE, Some(payload)));
        }
        kinds::CONFIRM => {
            let payload = match envelope.payload_as::<ConfirmPayload>() {
                Ok(confirm) => match prompt.confirm(&confirm.message).await {
                    Ok(approved) => json!({"approved": approved}),
                    Err(err) => json!({"error": err.to_string()}),
                },
                Err(err) => json!({"error": err.to_string()}),
            };
            send(inbound, envelope.reply(kinds::RESPONSE, Some(payload)));
        }
        kinds::EXTERNAL => send(
            inbound,
            envelope.reply(
                kinds::RESPONSE,
                Some(json!({"error": "no external bridge is attached to this session"})),
            ),
        ),
        kinds::TASK_RESULT | kinds::TASK_ERROR => {
            if let Some(stray) = tracker.resolve(envelope) {
                debug!(request_id = ?stray.request_id, "result for an unknown run");
            }
        }
        kinds::ERROR => warn!(error = ?envelope.error_message(), "worker reported an error"),
        other => debug!(kind = other, "ignoring worker message"),
    }
}
