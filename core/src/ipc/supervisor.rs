//! Restarting supervisor for a worker process
//!
//! Envelopes queued while the worker is down are delivered to the next
//! incarnation. After `max_restarts` restarts the failure is terminal.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Envelope, IpcError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay_ms: 1_000,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Program and arguments that start one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// A worker incarnation is up; `restarts` is 0 for the first one
    Started { restarts: u32, pid: Option<u32> },
    Message(Envelope),
    Exited { code: Option<i32> },
    Restarting { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
}

pub struct WorkerSupervisor {
    command: WorkerCommand,
    config: SupervisorConfig,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl WorkerSupervisor {
    pub fn new(
        command: WorkerCommand,
        config: SupervisorConfig,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            command,
            config,
            events,
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).is_err() {
            debug!("supervisor event receiver dropped");
        }
    }

    fn spawn(&self) -> Result<Child, IpcError> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IpcError::Spawn {
                program: self.command.program.clone(),
                source,
            })
    }

    /// Keep a worker running until it exits cleanly, `inbound` closes and
    /// the worker drains, `cancel` fires, or the restart budget runs out.
    pub async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        cancel: CancellationToken,
    ) -> Result<(), IpcError> {
        let mut failures = 0u32;
        let mut inbound_open = true;

        loop {
            match self.spawn() {
                Ok(mut child) => {
                    self.emit(SupervisorEvent::Started {
                        restarts: failures,
                        pid: child.id(),
                    });
                    info!(program = %self.command.program, pid = ?child.id(), restarts = failures, "worker started");

                    let stdin = child.stdin.take();
                    let reader = child.stdout.take().map(|stdout| tokio::spawn(read_loop(stdout, self.events.clone())));

                    let status = tokio::select! {
                        status = pump(&mut child, stdin, &mut inbound, &mut inbound_open) => status,
                        _ = cancel.cancelled() => {
                            info!("supervisor cancelled, stopping worker");
                            if let Err(err) = child.kill().await {
                                warn!(error = %err, "failed to kill worker");
                            }
                            return Ok(());
                        }
                    };
                    if let Some(reader) = reader {
                        let _ = reader.await;
                    }

                    let status = status?;
                    self.emit(SupervisorEvent::Exited { code: status.code() });
                    if status.success() {
                        info!("worker exited cleanly");
                        return Ok(());
                    }
                    warn!(code = ?status.code(), "worker exited abnormally");
                }
                Err(err) => error!(error = %err, "worker failed to start"),
            }

            failures += 1;
            if failures > self.config.max_restarts {
                error!(attempts = failures, "giving up on worker");
                self.emit(SupervisorEvent::GaveUp { attempts: failures });
                return Err(IpcError::GaveUp { attempts: failures });
            }

            let delay = self.config.restart_delay();
            self.emit(SupervisorEvent::Restarting {
                attempt: failures,
                delay,
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}

/// Forward inbound envelopes to the worker until it exits
async fn pump(
    child: &mut Child,
    mut stdin: Option<ChildStdin>,
    inbound: &mut mpsc::UnboundedReceiver<Envelope>,
    inbound_open: &mut bool,
) -> Result<ExitStatus, IpcError> {
    if !*inbound_open {
        // Nothing more to send; EOF lets the worker wind down.
        stdin = None;
    }
    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),
            envelope = inbound.recv(), if stdin.is_some() => {
                let Some(envelope) = envelope else {
                    *inbound_open = false;
                    stdin = None;
                    continue;
                };
                let Some(pipe) = stdin.as_mut() else {
                    continue;
                };
                let line = envelope.encode()?;
                if let Err(err) = pipe.write_all(line.as_bytes()).await {
                    // Worker is going away; its exit status decides what happens next.
                    warn!(error = %err, "failed to write to worker");
                    stdin = None;
                }
            }
        }
    }
}

async fn read_loop(stdout: ChildStdout, events: mpsc::UnboundedSender<SupervisorEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match Envelope::decode(&line) {
                Ok(envelope) => {
                    if events.send(SupervisorEvent::Message(envelope)).is_err() {
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "worker wrote a malformed envelope"),
            },
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "failed to read worker output");
                return;
            }
        }
    }
}
