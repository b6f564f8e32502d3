//! End-to-end tests: scripted model stream through parser, processor,
//! engine, handlers and history.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use weft_core::agent::{AgentEvent, AgentHandle, ConversationHistory, ConversationItem, Role};
use weft_core::llm::{ApiChunk, ApiHandler, ApiStream, ModelInfo, TokenUsage};
use weft_core::tools::{InMemoryStore, LocalFileOps, ShellRunner, UserPrompt};
use weft_core::{bootstrap, Agent, Collaborators, Container, RuntimeSettings, WeftError};

type Responder = Box<dyn Fn(&str, &[ConversationItem]) -> Vec<ApiChunk> + Send + Sync>;

/// Model stand-in that answers from a closure and records every request
struct ScriptedApi {
    respond: Responder,
    requests: Mutex<Vec<(String, usize)>>,
    context_window: u32,
}

impl ScriptedApi {
    fn new(respond: impl Fn(&str, &[ConversationItem]) -> Vec<ApiChunk> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
            context_window: 100_000,
        }
    }

    /// Replies in order, streamed in small pieces
    fn turns(turns: &[&str]) -> Self {
        let queue = Mutex::new(turns.iter().map(|t| t.to_string()).collect::<VecDeque<_>>());
        Self::new(move |_, _| {
            let reply = queue.lock().pop_front().unwrap_or_else(|| "Nothing left to say.".to_string());
            chunked(&reply, 7)
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl ApiHandler for ScriptedApi {
    fn create_message(&self, system_prompt: &str, history: &[ConversationItem]) -> ApiStream {
        self.requests.lock().push((system_prompt.to_string(), history.len()));
        let chunks = (self.respond)(system_prompt, history);
        Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
    }

    fn model(&self) -> ModelInfo {
        ModelInfo {
            id: "scripted".to_string(),
            context_window: self.context_window,
        }
    }
}

fn chunked(text: &str, size: usize) -> Vec<ApiChunk> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|piece| ApiChunk::Text(piece.iter().collect()))
        .collect()
}

#[derive(Default)]
struct ScriptedPrompt {
    confirmations: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    fn confirming(answers: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            confirmations: Mutex::new(answers.iter().copied().collect()),
            ..Default::default()
        })
    }
}

#[async_trait]
impl UserPrompt for ScriptedPrompt {
    async fn ask(&self, question: &str, _options: &[String]) -> anyhow::Result<String> {
        self.asked.lock().push(question.to_string());
        anyhow::bail!("nobody is at the terminal")
    }

    async fn confirm(&self, message: &str) -> anyhow::Result<bool> {
        self.asked.lock().push(message.to_string());
        self.confirmations
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("unexpected confirmation"))
    }
}

fn wire(api: Arc<ScriptedApi>, root: &Path, prompt: Arc<ScriptedPrompt>, settings: RuntimeSettings) -> Arc<Container> {
    let collaborators = Collaborators {
        api,
        file_ops: Arc::new(LocalFileOps::new(root)),
        code_runner: Arc::new(ShellRunner::new()),
        prompt,
        memory: Arc::new(InMemoryStore::new()),
        browser: None,
        hub: None,
        external: None,
    };
    bootstrap(collaborators, settings).unwrap()
}

struct Run {
    outcome: weft_core::Result<String>,
    events: Vec<AgentEvent>,
    handle: AgentHandle,
}

async fn run_task(container: Arc<Container>, settings: &RuntimeSettings, history: ConversationHistory, task: &str) -> Run {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = AgentHandle::new("root", history).with_events(tx);
    let agent = Agent::new(handle.clone(), container, settings.agent.clone());

    let outcome = tokio::time::timeout(Duration::from_secs(10), agent.run(task))
        .await
        .expect("agent run hung");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    Run {
        outcome,
        events,
        handle,
    }
}

async fn history_texts(handle: &AgentHandle) -> Vec<String> {
    handle
        .history()
        .lock()
        .await
        .items()
        .iter()
        .map(|item| item.text().to_string())
        .collect()
}

#[tokio::test]
async fn test_streamed_fence_runs_between_text_blocks() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::turns(&[
        "intro\n```yaml\n- tool: thinking\n  content: x\n```\ntrailing",
        "Finished.",
    ]));
    let settings = RuntimeSettings::default();
    let container = wire(api.clone(), temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "say hi").await;
    assert_eq!(run.outcome.unwrap(), "Finished.");

    let order: Vec<String> = run
        .events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Text { content, .. } => Some(format!("text:{}", content)),
            AgentEvent::Reasoning { content, .. } => Some(format!("reasoning:{}", content)),
            AgentEvent::CommandStarted { key, .. } => Some(format!("start:{}", key)),
            _ => None,
        })
        .collect();
    assert_eq!(
        order,
        vec!["text:intro", "start:base.think", "reasoning:x", "text:trailing", "text:Finished."]
    );

    let texts = history_texts(&run.handle).await;
    assert_eq!(texts.len(), 4);
    assert_eq!(texts[0], "say hi");
    assert!(texts[1].starts_with("intro\n```yaml"));
    assert_eq!(texts[2], "[base.think] Done.");
    assert_eq!(texts[3], "Finished.");

    let requests = api.requests.lock();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1, 3, "second turn sees task, reply and results");
    assert!(!requests[0].0.contains("sub-agent"));
}

#[tokio::test]
async fn test_approved_commands_touch_the_workspace() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::turns(&[
        "```yaml\n- tool: file\n  cmd: create\n  path: notes.txt\n  content: hello\n- tool: file\n  cmd: read\n  path: notes.txt\n```",
        "Wrote the note.",
    ]));
    let prompt = ScriptedPrompt::confirming(&[true]);
    let settings = RuntimeSettings {
        approval: weft_core::engine::ApprovalPolicy {
            allow: vec!["file.read".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let container = wire(api, temp.path(), prompt.clone(), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "write a note").await;
    assert_eq!(run.outcome.unwrap(), "Wrote the note.");
    assert_eq!(std::fs::read_to_string(temp.path().join("notes.txt")).unwrap(), "hello");

    // Only the create needed consent; the read was allowed outright.
    let asked = prompt.asked.lock().clone();
    assert_eq!(asked.len(), 1);
    assert!(asked[0].starts_with("Allow file.create?"));

    let texts = history_texts(&run.handle).await;
    let results = &texts[2];
    assert!(results.contains("[file.create] Result:"));
    assert!(results.ends_with("[file.read] Result:\nhello"));
}

#[tokio::test]
async fn test_denied_command_is_reported_to_the_model() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::turns(&[
        "```yaml\ntool: coder\ncmd: cmd\ncommand: touch marker\n```",
        "Understood, skipping.",
    ]));
    let settings = RuntimeSettings::default();
    let container = wire(api, temp.path(), ScriptedPrompt::confirming(&[false]), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "make a marker").await;
    assert_eq!(run.outcome.unwrap(), "Understood, skipping.");
    assert!(!temp.path().join("marker").exists());

    let texts = history_texts(&run.handle).await;
    assert_eq!(texts[2], "[coder.cmd] Result:\nUser denied permission to run coder.cmd.");
}

#[tokio::test]
async fn test_complete_ends_the_task_mid_turn() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::turns(&[
        "```yaml\n- tool: complete\n  result: shipped\n- tool: file\n  cmd: create\n  path: late.txt\n  content: too late\n```",
    ]));
    let settings = RuntimeSettings::default();
    let container = wire(api.clone(), temp.path(), ScriptedPrompt::confirming(&[true]), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "ship it").await;
    assert_eq!(run.outcome.unwrap(), "shipped");
    assert_eq!(api.request_count(), 1);
    assert!(!temp.path().join("late.txt").exists());
    assert!(run
        .events
        .iter()
        .any(|e| matches!(e, AgentEvent::Completed { result, .. } if result == "shipped")));
}

#[tokio::test]
async fn test_unknown_tool_does_not_stop_the_turn() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::turns(&[
        "```yaml\n- tool: teleport\n  target: mars\n- tool: log\n  content: still here\n```",
        "Done anyway.",
    ]));
    let settings = RuntimeSettings::default();
    let container = wire(api, temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "go").await;
    assert_eq!(run.outcome.unwrap(), "Done anyway.");

    let texts = history_texts(&run.handle).await;
    assert!(texts[2].starts_with("[teleport] Unknown tool"));
    assert!(texts[2].ends_with("[base.log] Done."));
}

#[tokio::test]
async fn test_turn_limit_is_an_error() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::new(|_, _| {
        chunked("```yaml\ntool: thinking\ncontent: again\n```", 16)
    }));
    let mut settings = RuntimeSettings::default();
    settings.agent.max_turns = 2;
    let container = wire(api.clone(), temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "loop").await;
    assert!(matches!(run.outcome, Err(WeftError::TurnLimitReached { max_turns: 2 })));
    assert_eq!(api.request_count(), 2);
    assert!(run.events.iter().any(|e| matches!(e, AgentEvent::Failed { .. })));
}

#[tokio::test]
async fn test_aborted_agent_stops_before_the_model_is_called() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::turns(&["never"]));
    let settings = RuntimeSettings::default();
    let container = wire(api.clone(), temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let handle = AgentHandle::new("root", ConversationHistory::in_memory());
    handle.abort();
    let agent = Agent::new(handle, container, settings.agent.clone());

    assert!(matches!(agent.run("anything").await, Err(WeftError::Aborted)));
    assert_eq!(api.request_count(), 0);
}

#[tokio::test]
async fn test_context_overflow_truncates_history() {
    let temp = TempDir::new().unwrap();
    let turns = Mutex::new(VecDeque::from(vec![
        "```yaml\ntool: thinking\ncontent: one\n```",
        "```yaml\ntool: thinking\ncontent: two\n```",
        "All done.",
    ]));
    let mut api = ScriptedApi::new(move |_, _| {
        let reply = turns.lock().pop_front().unwrap_or("All done.");
        let mut chunks = chunked(reply, 64);
        chunks.push(ApiChunk::Usage(TokenUsage {
            prompt_tokens: 40,
            completion_tokens: 10,
            total_tokens: 50,
        }));
        chunks
    });
    api.context_window = 10;
    let api = Arc::new(api);
    let settings = RuntimeSettings::default();
    let container = wire(api, temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "think twice").await;
    assert_eq!(run.outcome.unwrap(), "All done.");

    // After turn two, entries 2 and 3 (first reply and its results) were dropped.
    let texts = history_texts(&run.handle).await;
    assert_eq!(texts.len(), 4);
    assert_eq!(texts[0], "think twice");
    assert!(texts[1].contains("content: two"));
    assert_eq!(texts[3], "All done.");
}

#[tokio::test]
async fn test_parallel_subtasks_report_back() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::new(|system_prompt, history| {
        let task = history[0].text().to_string();
        let reply = if system_prompt.contains("sub-agent") {
            format!("```yaml\n- tool: complete_parallel_node\n  content: finished {}\n```", task)
        } else if history.len() == 1 {
            "```yaml\n- tool: advance\n  cmd: parallel\n  tasks:\n    - alpha\n    - beta\n```".to_string()
        } else {
            "Both halves are done.".to_string()
        };
        chunked(&reply, 11)
    }));
    let mut settings = RuntimeSettings::default();
    settings.approval.auto_approve = true;
    let container = wire(api.clone(), temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "split the work").await;
    assert_eq!(run.outcome.unwrap(), "Both halves are done.");

    let texts = history_texts(&run.handle).await;
    let report = &texts[2];
    assert!(report.starts_with("[advance.parallel] Result:"));
    assert!(report.contains("completed: finished alpha"));
    assert!(report.contains("completed: finished beta"));
    assert_eq!(report.matches("[root-").count(), 2, "one report per child");

    assert!(run
        .events
        .iter()
        .any(|e| matches!(e, AgentEvent::Progress { message, .. } if message.starts_with("Started 2 subtasks"))));
    assert_eq!(api.request_count(), 4);
}

#[tokio::test]
async fn test_persisted_history_survives_a_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data").join("history.json");
    let settings = RuntimeSettings::default();

    let api = Arc::new(ScriptedApi::turns(&["First answer."]));
    let container = wire(api, temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());
    let history = ConversationHistory::open(&path).await.unwrap();
    let run = run_task(container, &settings, history, "first question").await;
    assert_eq!(run.outcome.unwrap(), "First answer.");

    let api = Arc::new(ScriptedApi::turns(&["Second answer."]));
    let container = wire(api.clone(), temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());
    let history = ConversationHistory::open(&path).await.unwrap();
    assert_eq!(history.len(), 2);
    let run = run_task(container, &settings, history, "second question").await;
    assert_eq!(run.outcome.unwrap(), "Second answer.");

    let history = run.handle.history().lock().await;
    let ids: Vec<Option<u64>> = history.items().iter().map(|item| item.history_id()).collect();
    assert_eq!(ids, vec![Some(1), Some(2), Some(3), Some(4)]);
    assert_eq!(api.requests.lock()[0].1, 3, "the model sees the earlier exchange");
}

#[tokio::test]
async fn test_streamed_blocks_keep_their_message_ids() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::turns(&[
        "intro\n```yaml\n- tool: thinking\n  content: x\n```\ntrailing",
        "Finished.",
    ]));
    let settings = RuntimeSettings::default();
    let container = wire(api, temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "say hi").await;
    assert_eq!(run.outcome.unwrap(), "Finished.");

    let previewed: Vec<&str> = run
        .events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Partial { message_id, .. } => Some(message_id.as_str()),
            _ => None,
        })
        .collect();

    let (intro_id, intro_replacing) = run
        .events
        .iter()
        .find_map(|event| match event {
            AgentEvent::Text {
                message_id: Some(id),
                content,
                replacing,
                ..
            } if content == "intro" => Some((id.clone(), *replacing)),
            _ => None,
        })
        .unwrap();
    assert!(intro_replacing);
    assert!(previewed.contains(&intro_id.as_str()));

    let (started_id, started_replacing) = run
        .events
        .iter()
        .find_map(|event| match event {
            AgentEvent::CommandStarted {
                message_id, replacing, ..
            } => Some((message_id.clone(), *replacing)),
            _ => None,
        })
        .unwrap();
    assert!(started_replacing);
    assert_ne!(started_id, intro_id);
    assert!(started_id.starts_with("root#"));
    assert!(run.events.iter().any(
        |event| matches!(event, AgentEvent::CommandFinished { message_id, .. } if *message_id == started_id)
    ));

    // Ids are never reused, not even across turns.
    let mut finished: Vec<String> = run
        .events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Text { message_id, .. } => message_id.clone(),
            _ => None,
        })
        .collect();
    finished.push(started_id);
    let count = finished.len();
    finished.sort();
    finished.dedup();
    assert_eq!(finished.len(), count);
}

#[tokio::test]
async fn test_blocks_complete_on_arrival_are_not_replacements() {
    let temp = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::new(|_, history| {
        let reply = if history.len() == 1 {
            "intro\n```yaml\n- tool: thinking\n  content: x\n```\ntrailing"
        } else {
            "Finished."
        };
        vec![ApiChunk::Text(reply.to_string())]
    }));
    let settings = RuntimeSettings::default();
    let container = wire(api, temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());

    let run = run_task(container, &settings, ConversationHistory::in_memory(), "say hi").await;
    assert_eq!(run.outcome.unwrap(), "Finished.");

    let flags: Vec<(String, bool)> = run
        .events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Text { content, replacing, .. } => Some((content.clone(), *replacing)),
            AgentEvent::CommandStarted { key, replacing, .. } => Some((key.clone(), *replacing)),
            _ => None,
        })
        .collect();
    assert_eq!(
        flags,
        vec![
            ("intro".to_string(), false),
            ("base.think".to_string(), false),
            // Trailing prose stays partial until the stream ends.
            ("trailing".to_string(), true),
            ("Finished.".to_string(), true),
        ]
    );
}

#[tokio::test]
async fn test_resumed_history_keeps_roles_alternating() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");

    let api = Arc::new(ScriptedApi::new(|_, _| {
        chunked("```yaml\ntool: thinking\ncontent: again\n```", 16)
    }));
    let mut settings = RuntimeSettings::default();
    settings.agent.max_turns = 1;
    let container = wire(api, temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());
    let history = ConversationHistory::open(&path).await.unwrap();
    let run = run_task(container, &settings, history, "first task").await;
    assert!(matches!(run.outcome, Err(WeftError::TurnLimitReached { max_turns: 1 })));

    let settings = RuntimeSettings::default();
    let api = Arc::new(ScriptedApi::turns(&["Picked it up again."]));
    let container = wire(api.clone(), temp.path(), Arc::new(ScriptedPrompt::default()), settings.clone());
    let history = ConversationHistory::open(&path).await.unwrap();
    let run = run_task(container, &settings, history, "second task").await;
    assert_eq!(run.outcome.unwrap(), "Picked it up again.");

    let history = run.handle.history().lock().await;
    let roles: Vec<Role> = history.items().iter().map(|item| item.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(history.items()[3].text(), "(The previous run stopped before finishing.)");
    assert_eq!(history.items()[4].text(), "second task");
    assert_eq!(api.requests.lock()[0].1, 5);
}
