//! Inter-process envelope channel
//!
//! Processes talk in newline-delimited JSON envelopes
//! `{type, payload?, requestId?}`. A request's `requestId` is echoed on its
//! response so concurrent in-flight calls can be told apart.

pub mod supervisor;
pub mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

pub use supervisor::{SupervisorConfig, SupervisorEvent, WorkerCommand, WorkerSupervisor};
pub use worker::{ParentLink, Worker};

/// Envelope `type` values
pub mod kinds {
    pub const RUN_TASK: &str = "run_task";
    pub const ABORT: &str = "abort";
    pub const ABORTED: &str = "aborted";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const EVENT: &str = "event";
    pub const TASK_RESULT: &str = "task_result";
    pub const TASK_ERROR: &str = "task_error";
    pub const ASK: &str = "ask";
    pub const CONFIRM: &str = "confirm";
    pub const EXTERNAL: &str = "external";
    pub const RESPONSE: &str = "response";
    pub const ERROR: &str = "error";
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed envelope {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("envelope payload does not match {expected}: {source}")]
    Payload {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("the other side of the channel is gone")]
    ChannelClosed,

    #[error("request {request_id} got no response within {duration:?}")]
    Timeout { request_id: String, duration: Duration },

    #[error("remote side reported: {message}")]
    Remote { message: String },

    #[error("failed to start worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker kept failing, gave up after {attempts} attempts")]
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            request_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Response to this envelope, carrying the same `requestId`
    pub fn reply(&self, kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id: self.request_id.clone(),
        }
    }

    /// One line of the channel, newline included
    pub fn encode(&self) -> Result<String, IpcError> {
        let mut line = serde_json::to_string(self).map_err(|source| IpcError::Payload {
            expected: "envelope",
            source,
        })?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self, IpcError> {
        serde_json::from_str(line.trim()).map_err(|source| IpcError::Malformed {
            line: line.trim().to_string(),
            source,
        })
    }

    /// Deserialize the payload; a missing payload reads as `{}`
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        let payload = self.payload.clone().unwrap_or_else(|| Value::Object(Default::default()));
        serde_json::from_value(payload).map_err(|source| IpcError::Payload {
            expected: std::any::type_name::<T>(),
            source,
        })
    }

    /// `payload.error`, when the remote side answered with a failure
    pub fn error_message(&self) -> Option<&str> {
        self.payload.as_ref()?.get("error")?.as_str()
    }
}

/// Matches responses to in-flight requests by `requestId`
pub struct RequestTracker {
    prefix: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl RequestTracker {
    /// Ids are `<prefix>-<n>`; give each side its own prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_id(&self) -> String {
        format!("{}-{}", self.prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start tracking `request_id`
    pub fn register(&self, request_id: impl Into<String>) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.into(), tx);
        rx
    }

    /// Build a tracked request envelope with a fresh id
    pub fn request(&self, kind: &str, payload: Value) -> (Envelope, oneshot::Receiver<Envelope>) {
        let request_id = self.next_id();
        let rx = self.register(request_id.clone());
        (Envelope::new(kind).with_payload(payload).with_request_id(request_id), rx)
    }

    /// Hand a response to its waiter. Returns the envelope back when nobody
    /// is waiting for it.
    pub fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let Some(request_id) = envelope.request_id.as_deref() else {
            return Some(envelope);
        };
        let Some(waiter) = self.pending.lock().remove(request_id) else {
            return Some(envelope);
        };
        if let Err(envelope) = waiter.send(envelope) {
            debug!(request_id = ?envelope.request_id, "waiter dropped before the response arrived");
        }
        None
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every waiter with [`IpcError::ChannelClosed`]
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }

    /// Await a response, optionally bounded by `timeout`
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<Envelope>,
        timeout: Option<Duration>,
    ) -> Result<Envelope, IpcError> {
        let received = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().remove(request_id);
                    return Err(IpcError::Timeout {
                        request_id: request_id.to_string(),
                        duration,
                    });
                }
            },
            None => rx.await,
        };
        received.map_err(|_| IpcError::ChannelClosed)
    }
}
