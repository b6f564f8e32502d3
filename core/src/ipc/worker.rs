//! Worker side of the envelope channel
//!
//! `weft worker` reads envelopes from stdin and writes envelopes to stdout.
//! Each `run_task` runs one agent on its own tokio task; its events stream
//! back as `event` envelopes tagged with the task's `requestId`. Questions
//! for the operator travel the other way through [`ParentLink`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{kinds, Envelope, IpcError, RequestTracker};
use crate::agent::context::{AgentEvent, AgentHandle};
use crate::agent::core::{Agent, AgentSettings};
use crate::agent::history::ConversationHistory;
use crate::container::Container;
use crate::tools::{ExternalBridge, UserPrompt};

#[derive(Debug, Deserialize)]
struct RunTask {
    task: String,
}

#[derive(Debug, Default, Deserialize)]
struct AbortTarget {
    /// `requestId` of the run to abort; every run when absent
    #[serde(default)]
    target: Option<String>,
}

/// Requests from the worker to its parent process
pub struct ParentLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    tracker: RequestTracker,
    timeout: Option<Duration>,
}

impl ParentLink {
    fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            outbound,
            tracker: RequestTracker::new("w"),
            timeout: None,
        }
    }

    /// Queue an envelope for the parent; dropped when the channel is gone
    pub fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            debug!("parent channel closed, envelope dropped");
        }
    }

    async fn request(&self, kind: &str, payload: Value) -> Result<Value, IpcError> {
        let (envelope, rx) = self.tracker.request(kind, payload);
        let request_id = envelope.request_id.clone().unwrap_or_default();
        self.outbound.send(envelope).map_err(|_| IpcError::ChannelClosed)?;

        let response = self.tracker.wait(&request_id, rx, self.timeout).await?;
        if let Some(message) = response.error_message() {
            return Err(IpcError::Remote {
                message: message.to_string(),
            });
        }
        Ok(response.payload.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl UserPrompt for ParentLink {
    async fn ask(&self, question: &str, options: &[String]) -> anyhow::Result<String> {
        let payload = self
            .request(kinds::ASK, json!({"question": question, "options": options}))
            .await?;
        Ok(payload
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn confirm(&self, message: &str) -> anyhow::Result<bool> {
        let payload = self.request(kinds::CONFIRM, json!({"message": message})).await?;
        Ok(payload.get("approved").and_then(Value::as_bool).unwrap_or(false))
    }
}

#[async_trait]
impl ExternalBridge for ParentLink {
    async fn call(&self, command: Value) -> anyhow::Result<String> {
        let payload = self.request(kinds::EXTERNAL, command).await?;
        Ok(match payload {
            Value::String(text) => text,
            Value::Object(ref map) => match map.get("result") {
                Some(Value::String(text)) => text.clone(),
                _ => payload.to_string(),
            },
            other => other.to_string(),
        })
    }
}

/// Serves run requests from a parent process
pub struct Worker {
    link: Arc<ParentLink>,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            link: Arc::new(ParentLink::new(outbound)),
            outbound_rx,
        }
    }

    /// Collaborator to register as the `UserPrompt` / `ExternalBridge`
    pub fn link(&self) -> Arc<ParentLink> {
        self.link.clone()
    }

    /// Read envelopes until `reader` closes, then abort whatever is still
    /// running and flush the remaining replies.
    pub async fn serve<R, W>(
        self,
        reader: R,
        writer: W,
        container: Arc<Container>,
        settings: AgentSettings,
    ) -> Result<(), IpcError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self { link, outbound_rx } = self;
        let shutdown = CancellationToken::new();
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, shutdown.clone()));

        let running: Arc<Mutex<HashMap<String, CancellationToken>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();
        info!("worker ready");

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let envelope = match Envelope::decode(&line) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(error = %err, "dropping malformed envelope");
                    link.send(Envelope::new(kinds::ERROR).with_payload(json!({"error": err.to_string()})));
                    continue;
                }
            };

            match envelope.kind.as_str() {
                kinds::RESPONSE => {
                    if let Some(stray) = link.tracker.resolve(envelope) {
                        warn!(request_id = ?stray.request_id, "response for an unknown request");
                    }
                }
                kinds::PING => link.send(envelope.reply(kinds::PONG, None)),
                kinds::ABORT => {
                    let target = envelope.payload_as::<AbortTarget>().unwrap_or_default();
                    let aborted = abort_runs(&running, target.target.as_deref());
                    link.send(envelope.reply(kinds::ABORTED, Some(json!({"count": aborted}))));
                }
                kinds::RUN_TASK => match envelope.payload_as::<RunTask>() {
                    Ok(run) => {
                        let request_id = envelope
                            .request_id
                            .clone()
                            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                        let token = CancellationToken::new();
                        running.lock().insert(request_id.clone(), token.clone());
                        let agent = build_agent(&request_id, token, container.clone(), settings.clone());
                        tasks.spawn(run_task(
                            agent,
                            run.task,
                            envelope,
                            request_id,
                            link.clone(),
                            running.clone(),
                        ));
                    }
                    Err(err) => link.send(envelope.reply(kinds::ERROR, Some(json!({"error": err.to_string()})))),
                },
                other => {
                    warn!(kind = other, "unknown envelope type");
                    link.send(envelope.reply(
                        kinds::ERROR,
                        Some(json!({"error": format!("unknown message type: {}", other)})),
                    ));
                }
            }
        }

        info!(running = running.lock().len(), "input closed, shutting down");
        abort_runs(&running, None);
        link.tracker.cancel_all();
        while tasks.join_next().await.is_some() {}

        shutdown.cancel();
        match writer_task.await {
            Ok(result) => result,
            Err(err) => Err(IpcError::Io(std::io::Error::other(err))),
        }
    }
}

fn abort_runs(running: &Mutex<HashMap<String, CancellationToken>>, target: Option<&str>) -> usize {
    let running = running.lock();
    let mut count = 0;
    for (request_id, token) in running.iter() {
        if target.map_or(true, |target| target == request_id) {
            token.cancel();
            count += 1;
        }
    }
    count
}

fn build_agent(
    request_id: &str,
    token: CancellationToken,
    container: Arc<Container>,
    settings: AgentSettings,
) -> (Agent, mpsc::UnboundedReceiver<AgentEvent>) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let id = format!("worker-{}", request_id);
    let handle = AgentHandle::new(id, ConversationHistory::in_memory())
        .with_cancellation(token)
        .with_events(events);
    (Agent::new(handle, container, settings), events_rx)
}

async fn run_task(
    (agent, mut events): (Agent, mpsc::UnboundedReceiver<AgentEvent>),
    task: String,
    request: Envelope,
    request_id: String,
    link: Arc<ParentLink>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
) {
    let forward = |event| match serde_json::to_value(&event) {
        Ok(payload) => link.send(request.reply(kinds::EVENT, Some(payload))),
        Err(err) => warn!(error = %err, "failed to encode agent event"),
    };

    let run = agent.run(&task);
    tokio::pin!(run);
    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => forward(event),
            outcome = &mut run => break outcome,
        }
    };
    while let Ok(event) = events.try_recv() {
        forward(event);
    }

    running.lock().remove(&request_id);
    let reply = match outcome {
        Ok(result) => request.reply(kinds::TASK_RESULT, Some(json!({"result": result}))),
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "task failed");
            request.reply(
                kinds::TASK_ERROR,
                Some(json!({"error": err.user_message(), "retryable": err.is_retryable()})),
            )
        }
    };
    link.send(reply);
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    shutdown: CancellationToken,
) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;
            envelope = outbound.recv() => envelope,
            _ = shutdown.cancelled() => break,
        };
        let Some(envelope) = envelope else {
            break;
        };
        writer.write_all(envelope.encode()?.as_bytes()).await?;
        writer.flush().await?;
    }

    // Replies queued before shutdown still go out.
    while let Ok(envelope) = outbound.try_recv() {
        writer.write_all(envelope.encode()?.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}
