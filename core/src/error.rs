//! Structured error types for Weft
//!
//! Configuration mistakes (service wiring) are raised loudly; everything a
//! model can cause at runtime degrades into text instead of an error value.

use thiserror::Error;

use crate::agent::history::HistoryError;
use crate::container::ContainerError;
use crate::ipc::IpcError;

/// Primary error type for Weft operations
#[derive(Error, Debug)]
pub enum WeftError {
    // =========================================================================
    // Wiring / Configuration Errors
    // =========================================================================
    /// Service container misconfiguration
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    // =========================================================================
    // Agent Loop Errors
    // =========================================================================
    /// The agent was aborted between blocks
    #[error("task aborted")]
    Aborted,

    /// Turn limit reached without the model finishing
    #[error("turn limit reached (max {max_turns})")]
    TurnLimitReached { max_turns: usize },

    /// Model stream failed
    #[error("model stream failed: {message}")]
    Stream { message: String },

    // =========================================================================
    // Persistence / Process Errors
    // =========================================================================
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl WeftError {
    /// Whether a caller may try the same operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stream { .. } => true,
            Self::Ipc(err) => matches!(err, IpcError::Timeout { .. } | IpcError::ChannelClosed),
            Self::Container(_)
            | Self::InvalidConfig { .. }
            | Self::Aborted
            | Self::TurnLimitReached { .. }
            | Self::History(_) => false,
        }
    }

    /// Short message suitable for the terminal
    pub fn user_message(&self) -> String {
        match self {
            Self::Container(e) => format!("The runtime is misconfigured: {}", e),
            Self::Aborted => "The task was aborted.".to_string(),
            Self::TurnLimitReached { max_turns } => {
                format!("The agent stopped after {} turns without finishing.", max_turns)
            }
            _ => self.to_string(),
        }
    }
}

/// Result type alias using WeftError
pub type Result<T> = std::result::Result<T, WeftError>;
