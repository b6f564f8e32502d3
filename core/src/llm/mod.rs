//! LLM Api Handler abstraction
//!
//! The agent loop only needs a stream of chunks for a system prompt plus
//! history; providers live behind [`ApiHandler`].

pub mod openai;

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::agent::history::ConversationItem;

pub use openai::{OpenAiHandler, OpenAiSettings};

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One piece of a streamed model response
#[derive(Debug, Clone, PartialEq)]
pub enum ApiChunk {
    Text(String),
    Reasoning(String),
    Usage(TokenUsage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    /// Prompt plus completion tokens the model accepts
    pub context_window: u32,
}

pub type ApiStream = Pin<Box<dyn Stream<Item = anyhow::Result<ApiChunk>> + Send>>;

pub trait ApiHandler: Send + Sync {
    fn create_message(&self, system_prompt: &str, history: &[ConversationItem]) -> ApiStream;

    fn model(&self) -> ModelInfo;
}
