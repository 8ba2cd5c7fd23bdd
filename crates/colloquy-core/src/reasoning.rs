//! Reasoning Loop
//!
//! Drives one user turn: call the model, run the tool calls it asks for, feed
//! the results back, repeat until it answers in plain text or the iteration
//! ceiling is hit.
//!
//! ```text
//! AWAITING_MODEL ──> HAS_TOOL_CALLS ──> EXECUTING_TOOLS ──┐
//!       │  ^                                              │
//!       │  └──────────────────────────────────────────────┘
//!       └──> FINAL
//! ```
//!
//! Empty or malformed replies go through a retry ladder (with tools, with
//! tools after a delay, without tools) and end in an apology rather than an
//! error.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::approval::{
    ApprovalClass, ApprovalConfig, ApprovalDecision, ApprovalGate, ApprovalHandler,
    UnattendedApproval,
};
use crate::error::{AgentError, Result};
use crate::events::{EventSink, TurnEvent};
use crate::media::{MediaDispatcher, MediaResolver, PendingMedia};
use crate::message::Message;
use crate::provider::{LlmProvider, NormalizedMessage, ProviderEvent, ProviderStream};
use crate::registry::ToolRegistry;
use crate::session::{Session, SessionId, SessionStore, TurnId};
use crate::stream::{StreamRelay, split_reasoning};
use crate::tool::{Tool, ToolArguments, ToolCall, ToolResult, ToolSchema, encode_arguments, truncate_chars};

/// Returned when every retry failed to produce a usable reply
pub const APOLOGY_MESSAGE: &str =
    "I'm sorry, I wasn't able to generate a response just now. Please try again.";

/// Returned when the turn hits the iteration ceiling
pub const MAX_ITERATIONS_MESSAGE: &str =
    "I stopped after reaching the maximum number of steps for a single request. \
     Please try breaking it into smaller questions.";

pub const DENIED_BY_USER: &str = "Denied by user";
pub const DENIED_BY_POLICY: &str = "Denied by policy";
pub const DENIED_UNATTENDED: &str = "Denied: no approval handler available";

/// Tool arguments shown in `tool_start` events
const TOOL_ARGUMENTS_PREVIEW: usize = 200;
/// Tool output shown in `tool_end` events
const TOOL_RESULT_PREVIEW: usize = 500;

/// Agent configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Inserted at the head of sessions that have no system message
    pub system_prompt: String,

    /// Model calls per turn before giving up
    pub max_iterations: usize,

    /// Pause before the second attempt of the retry ladder
    pub retry_delay_ms: u64,

    /// Decision for approval-required calls when the turn has no handler
    pub unattended_approval: UnattendedApproval,

    /// Offer tool schemas to models that support tools
    pub advertise_tools: bool,

    /// Static approval sets
    pub approval: ApprovalConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 10,
            retry_delay_ms: 500,
            unattended_approval: UnattendedApproval::default(),
            advertise_tools: true,
            approval: ApprovalConfig::default(),
        }
    }
}

impl AgentConfig {
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.

Use the available tools when they help answer the question, then synthesize \
their results into a clear response. If you can answer directly, do so.

To show pictures, write ![SEARCH: \"query\"]; to show a video, write \
![VIDEO: \"query\"]. Be concise and accurate.";

/// Hooks fired while a turn runs. All methods default to no-ops.
pub trait TurnObserver: Send + Sync {
    fn on_tool_start(&self, _tool: &str, _arguments: &ToolArguments) {}

    fn on_tool_end(&self, _tool: &str, _result: &ToolResult) {}

    /// Final text of the turn, including the apology and iteration sentinel
    fn on_final_message(&self, _content: &str) {}
}

/// Everything one turn needs besides the agent itself.
///
/// Built by the caller per turn; the agent keeps no per-session state.
pub struct TurnContext<'a> {
    pub session: &'a mut Session,
    approval: Option<&'a dyn ApprovalHandler>,
    observer: Option<&'a dyn TurnObserver>,
    store: Option<Arc<dyn SessionStore>>,
    media: Option<Arc<dyn MediaResolver>>,
}

impl<'a> TurnContext<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Self {
            session,
            approval: None,
            observer: None,
            store: None,
            media: None,
        }
    }

    #[must_use]
    pub fn with_approval(mut self, handler: &'a dyn ApprovalHandler) -> Self {
        self.approval = Some(handler);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn TurnObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Store that late media results are patched into
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_media_resolver(mut self, resolver: Arc<dyn MediaResolver>) -> Self {
        self.media = Some(resolver);
        self
    }
}

/// Result of a streamed turn.
///
/// Persist the session, then call [`PendingMedia::commit`] so background
/// media results can be patched into the stored turn.
pub struct StreamedTurn {
    /// Final answer with reasoning removed
    pub content: String,
    pub turn_id: TurnId,
    pub pending_media: PendingMedia,
}

/// What happened to one tool call
enum Dispatch {
    Ran(ToolResult),
    Denied(&'static str),
}

impl Dispatch {
    /// Content of the tool-role message
    fn message_content(&self) -> String {
        match self {
            Self::Ran(result) => result.to_json_string(),
            Self::Denied(reason) => json!({ "error": reason }).to_string(),
        }
    }

    fn into_result(self) -> ToolResult {
        match self {
            Self::Ran(result) => result,
            Self::Denied(reason) => ToolResult::failure(reason),
        }
    }
}

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    gate: ApprovalGate,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        let gate = ApprovalGate::new(&config.approval);
        Self {
            provider,
            tools,
            gate,
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self::new(provider, tools, AgentConfig::default())
    }

    /// Whether calling `tool_name` needs a human decision
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        self.gate
            .requires_approval(tool_name, self.tools.source_of(tool_name))
    }

    /// Run one turn and return the final text
    #[tracing::instrument(skip_all, fields(session = %ctx.session.id))]
    pub async fn run_turn(&self, ctx: &mut TurnContext<'_>, message: Message) -> Result<String> {
        self.drive(ctx, message, None).await
    }

    /// Run one turn on a throwaway session
    pub async fn ask(&self, question: &str) -> Result<String> {
        let mut session = Session::with_system_prompt(SessionId::new(), &self.config.system_prompt);
        let mut ctx = TurnContext::new(&mut session);
        self.run_turn(&mut ctx, Message::user(question)).await
    }

    /// Run one turn, publishing decoded tokens, tool progress and media
    /// results to `sink`.
    ///
    /// Unrecoverable errors are reported as an `error` event and then
    /// returned.
    #[tracing::instrument(skip_all, fields(session = %ctx.session.id))]
    pub async fn run_streaming(
        &self,
        ctx: &mut TurnContext<'_>,
        message: Message,
        sink: Arc<dyn EventSink>,
    ) -> Result<StreamedTurn> {
        let turn_id = ctx.session.begin_turn();
        tracing::info!(turn = %turn_id, "Streaming turn started");

        let media = MediaDispatcher::new(
            ctx.media.clone(),
            Arc::clone(&sink),
            ctx.store.clone(),
            ctx.session.id.clone(),
            turn_id,
        );
        let mut relay = StreamRelay::new(sink, media);

        let text = match self.drive(ctx, message, Some(&mut relay)).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(turn = %turn_id, error = %e, "Streaming turn failed");
                relay
                    .send(TurnEvent::Error {
                        message: e.user_message(),
                    })
                    .await;
                return Err(e);
            }
        };

        let (content, _) = split_reasoning(&text);
        relay
            .send(TurnEvent::Complete {
                content: content.clone(),
            })
            .await;
        if !relay.is_open() {
            tracing::debug!(turn = %turn_id, "Transport closed during turn");
        }

        ctx.session.mark_committed(turn_id)?;
        Ok(StreamedTurn {
            content,
            turn_id,
            pending_media: relay.into_media().into_pending(),
        })
    }

    async fn drive(
        &self,
        ctx: &mut TurnContext<'_>,
        message: Message,
        mut relay: Option<&mut StreamRelay>,
    ) -> Result<String> {
        ctx.session
            .conversation
            .ensure_system_prompt(&self.config.system_prompt);
        ctx.session.conversation.push(message);
        ctx.session.touch();

        for iteration in 1..=self.config.max_iterations {
            tracing::debug!(iteration, "Awaiting model");
            let schemas = self.advertised_schemas();

            let Some(reply) = self
                .complete_with_retries(ctx.session.conversation.messages(), &schemas, relay.as_deref_mut())
                .await?
            else {
                tracing::warn!(iteration, "No usable reply after retries; apologizing");
                return Ok(Self::conclude(ctx, APOLOGY_MESSAGE.to_string(), true));
            };

            let NormalizedMessage {
                content, tool_calls, ..
            } = reply;
            ctx.session
                .conversation
                .push(Message::assistant_with_tools(content.clone(), tool_calls.clone()));

            if tool_calls.is_empty() {
                return Ok(Self::conclude(ctx, content.unwrap_or_default(), false));
            }

            tracing::debug!(iteration, calls = tool_calls.len(), "Executing tool calls");
            for call in tool_calls {
                self.dispatch(ctx, call, relay.as_deref_mut()).await;
            }
        }

        tracing::warn!(max = self.config.max_iterations, "Iteration ceiling reached");
        Ok(Self::conclude(ctx, MAX_ITERATIONS_MESSAGE.to_string(), true))
    }

    /// Record the final text for the turn.
    ///
    /// Model answers are already in the store; synthesized ones are appended.
    fn conclude(ctx: &mut TurnContext<'_>, text: String, synthesized: bool) -> String {
        if synthesized {
            ctx.session.conversation.push(Message::assistant(text.as_str()));
        }
        ctx.session.touch();
        if let Some(observer) = ctx.observer {
            observer.on_final_message(&text);
        }
        text
    }

    fn advertised_schemas(&self) -> Vec<ToolSchema> {
        if self.config.advertise_tools && self.provider.capabilities().supports_tools {
            self.tools.all_schemas()
        } else {
            Vec::new()
        }
    }

    /// Model call with the retry ladder. `Ok(None)` means every attempt
    /// came back empty or malformed.
    async fn complete_with_retries(
        &self,
        messages: &[Message],
        schemas: &[ToolSchema],
        mut relay: Option<&mut StreamRelay>,
    ) -> Result<Option<NormalizedMessage>> {
        let ladder: [(&[ToolSchema], Duration); 3] = [
            (schemas, Duration::ZERO),
            (schemas, self.config.retry_delay()),
            (&[], Duration::ZERO),
        ];

        for (attempt, (tools, delay)) in ladder.into_iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.call_model(messages, tools, relay.as_deref_mut()).await {
                Ok(reply) => return Ok(Some(reply)),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(attempt = attempt + 1, tools = tools.len(), error = %e, "Degraded model reply");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn call_model(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        relay: Option<&mut StreamRelay>,
    ) -> Result<NormalizedMessage> {
        let Some(relay) = relay else {
            return self.provider.call(messages, tools).await?.ensure_usable();
        };

        let mut stream = self.provider.stream(messages, tools).await?;
        let outcome = Self::drain_stream(&mut stream, relay).await;
        // Decoder state never outlives the call, whichever way it ended
        relay.finish_call().await;

        outcome?
            .ok_or_else(|| AgentError::Provider("stream ended without a final message".into()))?
            .ensure_usable()
    }

    async fn drain_stream(
        stream: &mut ProviderStream,
        relay: &mut StreamRelay,
    ) -> Result<Option<NormalizedMessage>> {
        while let Some(event) = stream.next().await {
            match event? {
                ProviderEvent::Token(token) => relay.push_token(&token).await,
                ProviderEvent::ToolCallDelta(_) => {}
                ProviderEvent::Done(done) => return Ok(Some(done)),
            }
        }
        Ok(None)
    }

    async fn dispatch(&self, ctx: &mut TurnContext<'_>, call: ToolCall, mut relay: Option<&mut StreamRelay>) {
        let ToolCall { id, name, arguments } = call;
        tracing::debug!(tool = %name, id = ?id, "Dispatching tool call");

        if let Some(observer) = ctx.observer {
            observer.on_tool_start(&name, &arguments);
        }
        if let Some(relay) = relay.as_deref_mut() {
            relay
                .send(TurnEvent::ToolStart {
                    tool: name.clone(),
                    arguments: truncate_chars(&encode_arguments(&arguments), TOOL_ARGUMENTS_PREVIEW),
                })
                .await;
        }

        let outcome = match self.authorize(ctx, &name, arguments).await {
            Ok(arguments) => Dispatch::Ran(self.execute_tool(&name, &arguments).await),
            Err(reason) => {
                tracing::info!(tool = %name, reason, "Tool call not executed");
                Dispatch::Denied(reason)
            }
        };

        let content = outcome.message_content();
        let result = outcome.into_result();
        if let Some(observer) = ctx.observer {
            observer.on_tool_end(&name, &result);
        }
        if let Some(relay) = relay {
            relay
                .send(TurnEvent::ToolEnd {
                    tool: name.clone(),
                    success: result.success,
                    result: result.summary(TOOL_RESULT_PREVIEW),
                })
                .await;
        }

        ctx.session.conversation.push(Message::tool(content, id, name));
    }

    /// Arguments to run with, or the reason the call was refused
    async fn authorize(
        &self,
        ctx: &TurnContext<'_>,
        name: &str,
        arguments: ToolArguments,
    ) -> std::result::Result<ToolArguments, &'static str> {
        match self.gate.classify(name, self.tools.source_of(name)) {
            ApprovalClass::AutoApproved => return Ok(arguments),
            ApprovalClass::Denied => return Err(DENIED_BY_POLICY),
            ApprovalClass::ApprovalRequired => {}
        }

        let (decision, denied) = match ctx.approval {
            Some(handler) => {
                tracing::debug!(tool = %name, "Awaiting approval");
                let decision = handler
                    .request_approval(&ctx.session.id, name, &arguments)
                    .await;
                (decision, DENIED_BY_USER)
            }
            None => (self.config.unattended_approval.decision(), DENIED_UNATTENDED),
        };

        match decision {
            ApprovalDecision::Approve => Ok(arguments),
            ApprovalDecision::ApproveWithArguments(replacement) => Ok(replacement),
            ApprovalDecision::Deny => Err(denied),
        }
    }

    /// Execute a tool; failures become failed results
    async fn execute_tool(&self, name: &str, arguments: &ToolArguments) -> ToolResult {
        match self.tools.execute(name, arguments).await {
            Ok(result) => result,
            Err(e) => {
                if e.is_tool_local() {
                    tracing::debug!(tool = %name, error = %e, "Tool call failed");
                } else {
                    tracing::warn!(tool = %name, error = %e, "Tool raised an unexpected error");
                }
                ToolResult::failure(e.to_string())
            }
        }
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the provider
    pub fn provider(&self) -> &dyn LlmProvider {
        self.provider.as_ref()
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: ToolRegistry::new(),
            config: AgentConfig::default(),
        }
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Add a built-in tool
    #[must_use]
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.register_builtin(tool);
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    #[must_use]
    pub const fn retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.config.retry_delay_ms = delay_ms;
        self
    }

    #[must_use]
    pub const fn unattended_approval(mut self, policy: UnattendedApproval) -> Self {
        self.config.unattended_approval = policy;
        self
    }

    #[must_use]
    pub fn approval(mut self, approval: ApprovalConfig) -> Self {
        self.config.approval = approval;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        Ok(Agent::new(provider, Arc::new(self.tools), self.config))
    }
}
