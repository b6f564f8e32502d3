//! `coder.*`: shell command lines and node snippets

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::or_no_output;
use crate::agent::context::ExecutionContext;
use crate::engine::{Command, CommandHandler};
use crate::tools::CodeRunner;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum CoderOp {
    Cmd {
        #[serde(alias = "content")]
        command: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    Node {
        #[serde(alias = "content")]
        code: String,
    },
}

pub struct CoderHandler {
    runner: Arc<dyn CodeRunner>,
}

impl CoderHandler {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl CommandHandler for CoderHandler {
    async fn execute(&self, command: &Command, _ctx: &ExecutionContext) -> anyhow::Result<Option<String>> {
        let output = match command.parse_op::<CoderOp>()? {
            CoderOp::Cmd { command, cwd } => self.runner.run_shell(&command, cwd.as_deref()).await?,
            CoderOp::Node { code } => self.runner.run_node(&code).await?,
        };
        Ok(Some(or_no_output(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::engine::handlers::testing;
    use crate::engine::CommandType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CodeRunner for RecordingRunner {
        async fn run_shell(&self, command: &str, cwd: Option<&str>) -> anyhow::Result<String> {
            self.calls.lock().push(format!("sh:{}:{}", command, cwd.unwrap_or("-")));
            Ok(String::new())
        }

        async fn run_node(&self, code: &str) -> anyhow::Result<String> {
            self.calls.lock().push(format!("node:{}", code));
            Ok("2\n".to_string())
        }
    }

    #[tokio::test]
    async fn test_dispatches_to_runner() {
        let runner = Arc::new(RecordingRunner::default());
        let handler = CoderHandler::new(runner.clone());
        let (ctx, _events) = testing::context(Container::new());

        let shell = Command::new(CommandType::Coder)
            .with("cmd", "cmd")
            .with("command", "make")
            .with("cwd", "/tmp");
        assert_eq!(handler.execute(&shell, &ctx).await.unwrap().as_deref(), Some("(no output)"));

        let node = Command::new(CommandType::Coder).with("cmd", "node").with("content", "console.log(1+1)");
        assert_eq!(handler.execute(&node, &ctx).await.unwrap().as_deref(), Some("2\n"));

        assert_eq!(*runner.calls.lock(), vec!["sh:make:/tmp", "node:console.log(1+1)"]);
    }
}
