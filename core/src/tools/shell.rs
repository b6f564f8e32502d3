//! Code execution collaborator
//!
//! Runs shell command lines and node snippets with safety checks and a
//! timeout.

use std::process::Output;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::debug;

use super::CodeRunner;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_SIZE: usize = 100_000; // 100KB max output
const DANGEROUS_PATTERNS: &[&str] = &["rm -rf /", "> /dev/sda", "dd if=/dev/zero", ":(){ :|:& };:"];

/// Runs commands as child processes
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
    node_binary: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            node_binary: "node".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_node_binary(mut self, binary: impl Into<String>) -> Self {
        self.node_binary = binary.into();
        self
    }

    async fn run(&self, mut command: Command, label: &str) -> Result<String> {
        command.kill_on_drop(true);
        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| anyhow::anyhow!("Command timed out after {} seconds", self.timeout.as_secs()))?
            .with_context(|| format!("Failed to start {}", label))?;
        collect_output(output)
    }
}

fn collect_output(output: Output) -> Result<String> {
    let mut result = String::new();
    if !output.stdout.is_empty() {
        result.push_str(&String::from_utf8_lossy(&output.stdout));
    }
    if !output.stderr.is_empty() {
        if !result.is_empty() {
            result.push_str("\n\n[stderr]:\n");
        } else {
            result.push_str("[stderr]:\n");
        }
        result.push_str(&String::from_utf8_lossy(&output.stderr));
    }

    if result.len() > MAX_OUTPUT_SIZE {
        let mut cut = MAX_OUTPUT_SIZE;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result.truncate(cut);
        result.push_str("\n... [output truncated]");
    }

    if output.status.success() {
        Ok(result)
    } else {
        let exit_code = output.status.code().unwrap_or(-1);
        bail!("Exit code {}: {}", exit_code, result)
    }
}

#[async_trait]
impl CodeRunner for ShellRunner {
    async fn run_shell(&self, command: &str, cwd: Option<&str>) -> Result<String> {
        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|pattern| command.contains(*pattern)) {
            bail!("Command blocked for safety: contains '{}'", pattern);
        }
        debug!(command, "running shell command");

        let mut process = if cfg!(target_os = "windows") {
            let mut process = Command::new("cmd");
            process.args(["/C", command]);
            process
        } else {
            let mut process = Command::new("sh");
            process.args(["-c", command]);
            process
        };
        if let Some(dir) = cwd {
            process.current_dir(dir);
        }
        self.run(process, "shell").await
    }

    async fn run_node(&self, code: &str) -> Result<String> {
        let mut process = Command::new(&self.node_binary);
        process.args(["-e", code]);
        self.run(process, &self.node_binary).await
    }
}
