//! Agent runtime
//!
//! - `parser` / `processor`: turn streamed model text into blocks and
//!   execute them one at a time
//! - `history`: the conversation log with embedded history ids
//! - `core`: the turn loop
//! - `coordinator`: fan-out to child agents

pub mod context;
pub mod coordinator;
pub mod core;
pub mod history;
pub mod parser;
pub mod processor;
pub mod prompt;

pub use context::{AgentEvent, AgentHandle, ExecutionContext};
pub use coordinator::{ClineStatus, ParallelCoordinator, StatusReport};
pub use history::{ConversationHistory, ConversationItem, Role};
pub use parser::Block;
pub use processor::BlockProcessor;
