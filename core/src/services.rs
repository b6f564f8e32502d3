//! Service identifiers and startup registration
//!
//! Every collaborator, handler and the engine itself is a container
//! service. `bootstrap` is the single place the runtime is wired.

use std::sync::Arc;

use crate::agent::coordinator::{AgentSpawner, ParallelCoordinator};
use crate::agent::core::{AgentSettings, AgentTaskSpawner};
use crate::container::{Arguments, Container, ContainerError, Factory, Registration, ServiceToken};
use crate::engine::handlers::{
    AdvanceHandler, ApprovalHandler, AskApprovalHandler, AskHandler, BaseHandler, BrowserHandler, CoderHandler,
    ExternalHandler, FileHandler, McpHandler, PlanHandler,
};
use crate::engine::{
    ApprovalMiddleware, ApprovalPolicy, CommandEngine, CommandHandler, CommandType, HandlerToken, TracingMiddleware,
    DEFAULT_RESULT_CAP,
};
use crate::llm::ApiHandler;
use crate::tools::{Browser, CodeRunner, ExternalBridge, FileOps, MemoryStore, ToolHub, UserPrompt};

pub const COMMAND_ENGINE: ServiceToken<Arc<CommandEngine>> = ServiceToken::new("commandEngine");
pub const API_HANDLER: ServiceToken<Arc<dyn ApiHandler>> = ServiceToken::new("apiHandler");
pub const AGENT_SETTINGS: ServiceToken<AgentSettings> = ServiceToken::new("agentSettings");
pub const AGENT_SPAWNER: ServiceToken<Arc<dyn AgentSpawner>> = ServiceToken::new("agentSpawner");
pub const COORDINATOR: ServiceToken<Arc<ParallelCoordinator>> = ServiceToken::new("parallelCoordinator");

pub const FILE_OPS: ServiceToken<Arc<dyn FileOps>> = ServiceToken::new("fileOps");
pub const CODE_RUNNER: ServiceToken<Arc<dyn CodeRunner>> = ServiceToken::new("codeRunner");
pub const USER_PROMPT: ServiceToken<Arc<dyn UserPrompt>> = ServiceToken::new("userPrompt");
pub const MEMORY_STORE: ServiceToken<Arc<dyn MemoryStore>> = ServiceToken::new("memoryStore");
pub const BROWSER: ServiceToken<Arc<dyn Browser>> = ServiceToken::new("browser");
pub const TOOL_HUB: ServiceToken<Arc<dyn ToolHub>> = ServiceToken::new("toolHub");
pub const EXTERNAL_BRIDGE: ServiceToken<Arc<dyn ExternalBridge>> = ServiceToken::new("externalBridge");

pub const BASE_HANDLER: HandlerToken = ServiceToken::new("handler.base");
pub const ASK_HANDLER: HandlerToken = ServiceToken::new("handler.ask");
pub const FILE_HANDLER: HandlerToken = ServiceToken::new("handler.file");
pub const BROWSER_HANDLER: HandlerToken = ServiceToken::new("handler.browser");
pub const CODER_HANDLER: HandlerToken = ServiceToken::new("handler.coder");
pub const ADVANCE_HANDLER: HandlerToken = ServiceToken::new("handler.advance");
pub const MCP_HANDLER: HandlerToken = ServiceToken::new("handler.mcp");
pub const PLAN_HANDLER: HandlerToken = ServiceToken::new("handler.plan");
pub const EXTERNAL_HANDLER: HandlerToken = ServiceToken::new("handler.external");
pub const APPROVAL_HANDLER: HandlerToken = ServiceToken::new("handler.approval");
pub const ASK_APPROVAL_HANDLER: HandlerToken = ServiceToken::new("handler.askApproval");

/// Command type to handler service
const HANDLERS: [(CommandType, HandlerToken); 11] = [
    (CommandType::Base, BASE_HANDLER),
    (CommandType::Ask, ASK_HANDLER),
    (CommandType::File, FILE_HANDLER),
    (CommandType::Browser, BROWSER_HANDLER),
    (CommandType::Coder, CODER_HANDLER),
    (CommandType::Advance, ADVANCE_HANDLER),
    (CommandType::Mcp, MCP_HANDLER),
    (CommandType::Plan, PLAN_HANDLER),
    (CommandType::External, EXTERNAL_HANDLER),
    (CommandType::Approval, APPROVAL_HANDLER),
    (CommandType::AskApproval, ASK_APPROVAL_HANDLER),
];

/// Implementations supplied by the host
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn ApiHandler>,
    pub file_ops: Arc<dyn FileOps>,
    pub code_runner: Arc<dyn CodeRunner>,
    pub prompt: Arc<dyn UserPrompt>,
    pub memory: Arc<dyn MemoryStore>,
    pub browser: Option<Arc<dyn Browser>>,
    pub hub: Option<Arc<dyn ToolHub>>,
    pub external: Option<Arc<dyn ExternalBridge>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub agent: AgentSettings,
    pub result_cap: usize,
    pub approval: ApprovalPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            agent: AgentSettings::default(),
            result_cap: DEFAULT_RESULT_CAP,
            approval: ApprovalPolicy::default(),
        }
    }
}

fn handler<H, F>(build: F) -> Factory
where
    H: CommandHandler + 'static,
    F: Fn(Arguments) -> Result<H, ContainerError> + Send + Sync + 'static,
{
    Factory::constructor(move |args| Ok(Arc::new(build(args)?) as Arc<dyn CommandHandler>))
}

/// Register every service the agent runtime needs
pub fn bootstrap(collaborators: Collaborators, settings: RuntimeSettings) -> Result<Arc<Container>, ContainerError> {
    let container = Container::new();

    container.register(API_HANDLER.id(), Registration::new(Factory::value(collaborators.api)))?;
    container.register(FILE_OPS.id(), Registration::new(Factory::value(collaborators.file_ops)))?;
    container.register(CODE_RUNNER.id(), Registration::new(Factory::value(collaborators.code_runner)))?;
    container.register(USER_PROMPT.id(), Registration::new(Factory::value(collaborators.prompt)))?;
    container.register(MEMORY_STORE.id(), Registration::new(Factory::value(collaborators.memory)))?;
    if let Some(browser) = collaborators.browser {
        container.register(BROWSER.id(), Registration::new(Factory::value(browser)))?;
    }
    if let Some(hub) = collaborators.hub {
        container.register(TOOL_HUB.id(), Registration::new(Factory::value(hub)))?;
    }
    if let Some(external) = collaborators.external {
        container.register(EXTERNAL_BRIDGE.id(), Registration::new(Factory::value(external)))?;
    }

    container.register(AGENT_SETTINGS.id(), Registration::new(Factory::value(settings.agent)))?;
    container.register(
        AGENT_SPAWNER.id(),
        Registration::new(Factory::constructor(|args| {
            Ok(Arc::new(AgentTaskSpawner::new(args.get(0)?)) as Arc<dyn AgentSpawner>)
        }))
        .depends_on(AGENT_SETTINGS.dependency()),
    )?;
    container.register(
        COORDINATOR.id(),
        Registration::new(Factory::constructor(|args| {
            Ok(Arc::new(ParallelCoordinator::new(args.get(0)?)))
        }))
        .depends_on(AGENT_SPAWNER.dependency()),
    )?;

    register_handlers(&container)?;

    let mut engine = CommandEngine::new().with_result_cap(settings.result_cap);
    for (kind, token) in HANDLERS {
        engine.register(kind, token);
    }
    engine.add_middleware(Arc::new(TracingMiddleware));
    engine.add_middleware(Arc::new(ApprovalMiddleware::new(settings.approval.into_predicate())));
    container.register(COMMAND_ENGINE.id(), Registration::new(Factory::value(Arc::new(engine))))?;

    Ok(Arc::new(container))
}

fn register_handlers(container: &Container) -> Result<(), ContainerError> {
    container.register(BASE_HANDLER.id(), Registration::new(handler(|_| Ok(BaseHandler::new()))))?;
    container.register(
        ASK_HANDLER.id(),
        Registration::new(handler(|args| Ok(AskHandler::new(args.get(0)?)))).depends_on(USER_PROMPT.dependency()),
    )?;
    container.register(
        APPROVAL_HANDLER.id(),
        Registration::new(handler(|args| Ok(ApprovalHandler::new(args.get(0)?))))
            .depends_on(USER_PROMPT.dependency()),
    )?;
    container.register(
        ASK_APPROVAL_HANDLER.id(),
        Registration::new(handler(|args| Ok(AskApprovalHandler::new(args.get(0)?))))
            .depends_on(USER_PROMPT.dependency()),
    )?;
    container.register(
        FILE_HANDLER.id(),
        Registration::new(handler(|args| Ok(FileHandler::new(args.get(0)?)))).depends_on(FILE_OPS.dependency()),
    )?;
    container.register(
        CODER_HANDLER.id(),
        Registration::new(handler(|args| Ok(CoderHandler::new(args.get(0)?)))).depends_on(CODE_RUNNER.dependency()),
    )?;
    container.register(
        ADVANCE_HANDLER.id(),
        Registration::new(handler(|args| Ok(AdvanceHandler::new(args.get(0)?))))
            .depends_on(MEMORY_STORE.dependency()),
    )?;
    container.register(BROWSER_HANDLER.id(), Registration::new(handler(|_| Ok(BrowserHandler::new()))))?;
    container.register(MCP_HANDLER.id(), Registration::new(handler(|_| Ok(McpHandler::new()))))?;
    container.register(PLAN_HANDLER.id(), Registration::new(handler(|_| Ok(PlanHandler::new()))))?;
    container.register(EXTERNAL_HANDLER.id(), Registration::new(handler(|_| Ok(ExternalHandler::new()))))?;
    Ok(())
}
