//! Weft core: streaming tool-call parsing, command dispatch and agent
//! orchestration for the `weft` terminal agent.

pub mod agent;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod llm;
pub mod services;
pub mod tools;

// Re-exports for convenience
pub use agent::core::{Agent, AgentSettings};
pub use config::WeftConfig;
pub use container::{Container, ContainerError, ServiceToken};
pub use error::{Result, WeftError};
pub use services::{bootstrap, Collaborators, RuntimeSettings};
