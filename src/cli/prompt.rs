//! Operator prompts on the controlling terminal

use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::{Confirm, Input, Select};
use tokio::sync::Mutex;
use weft_core::tools::UserPrompt;

#[derive(Default)]
pub struct TerminalPrompt {
    /// One question at a time, even when sub-agents ask concurrently
    turn: Mutex<()>,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a blocking dialoguer interaction off the async runtime
    async fn interact<T, F>(&self, prompt: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> dialoguer::Result<T> + Send + 'static,
    {
        let _turn = self.turn.lock().await;
        tokio::task::spawn_blocking(prompt)
            .await
            .context("Prompt task panicked")?
            .context("Failed to read from the terminal")
    }
}

/// The option at a `Select` index
fn chosen(options: &[String], index: usize) -> Result<String> {
    options
        .get(index)
        .cloned()
        .with_context(|| format!("selection {} is out of range", index))
}

#[async_trait]
impl UserPrompt for TerminalPrompt {
    async fn ask(&self, question: &str, options: &[String]) -> Result<String> {
        let question = question.to_string();
        if options.is_empty() {
            return self
                .interact(move || {
                    Input::<String>::new()
                        .with_prompt(question)
                        .allow_empty(true)
                        .interact_text()
                })
                .await;
        }

        let items = options.to_vec();
        let index = self
            .interact(move || Select::new().with_prompt(question).items(&items).default(0).interact())
            .await?;
        chosen(options, index)
    }

    async fn confirm(&self, message: &str) -> Result<bool> {
        let message = message.to_string();
        self.interact(move || Confirm::new().with_prompt(message).default(false).interact())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_maps_to_option() {
        let options = vec!["keep".to_string(), "discard".to_string()];
        assert_eq!(chosen(&options, 1).unwrap(), "discard");
        assert!(chosen(&options, 2).is_err());
    }

    #[tokio::test]
    async fn test_interactions_run_one_at_a_time() {
        let prompt = std::sync::Arc::new(TerminalPrompt::new());
        let guard = prompt.turn.lock().await;

        let waiting = {
            let prompt = prompt.clone();
            tokio::spawn(async move { prompt.interact(|| Ok(42)).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(guard);
        assert_eq!(waiting.await.unwrap().unwrap(), 42);
    }
}
