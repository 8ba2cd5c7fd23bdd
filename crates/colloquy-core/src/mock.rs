//! Scripted LLM provider for testing
//!
//! Replays a queue of canned replies, errors and token streams in order and
//! records what each call was offered, so turn behavior can be asserted
//! without a real backend.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{
    Capabilities, LlmProvider, NormalizedMessage, ProviderEvent, ProviderStream, check_media_support,
};
use crate::tool::ToolSchema;

enum Step {
    Reply(Result<NormalizedMessage>),
    Stream(Vec<Result<ProviderEvent>>),
}

/// What one call received
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub message_count: usize,
    /// Names of the schemas offered
    pub tools: Vec<String>,
}

/// A provider that plays back a fixed script
#[derive(Clone)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<RecordedCall>>>,
    capabilities: Capabilities,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            recorded: Arc::new(Mutex::new(Vec::new())),
            capabilities: Capabilities::default(),
        }
    }

    fn push(self, step: Step) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    /// Queue a reply
    #[must_use]
    pub fn reply(self, reply: NormalizedMessage) -> Self {
        self.push(Step::Reply(Ok(reply)))
    }

    /// Queue an error
    #[must_use]
    pub fn error(self, error: AgentError) -> Self {
        self.push(Step::Reply(Err(error)))
    }

    /// Queue a reply with neither text nor tool calls
    #[must_use]
    pub fn empty(self) -> Self {
        self.push(Step::Reply(Err(AgentError::EmptyResponse)))
    }

    /// Queue a streamed text reply delivered in `chunks`
    #[must_use]
    pub fn streamed(self, chunks: &[&str]) -> Self {
        let mut events: Vec<_> = chunks
            .iter()
            .map(|c| Ok(ProviderEvent::Token((*c).to_string())))
            .collect();
        events.push(Ok(ProviderEvent::Done(NormalizedMessage::text(chunks.concat()))));
        self.push(Step::Stream(events))
    }

    /// Queue a stream that delivers `chunks` and then fails with `error`
    #[must_use]
    pub fn stream_fails(self, chunks: &[&str], error: AgentError) -> Self {
        let mut events: Vec<_> = chunks
            .iter()
            .map(|c| Ok(ProviderEvent::Token((*c).to_string())))
            .collect();
        events.push(Err(error));
        self.push(Step::Stream(events))
    }

    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Number of calls made so far (batch and streaming)
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Steps not yet played
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next_step(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<Step> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                message_count: messages.len(),
                tools: tools.iter().map(|t| t.name.clone()).collect(),
            });
        check_media_support(messages, &self.capabilities)?;

        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| AgentError::Provider("script exhausted".into()))
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn call(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<NormalizedMessage> {
        match self.next_step(messages, tools)? {
            Step::Reply(reply) => reply,
            Step::Stream(events) => {
                for event in events {
                    if let ProviderEvent::Done(reply) = event? {
                        return Ok(reply);
                    }
                }
                Err(AgentError::EmptyResponse)
            }
        }
    }

    async fn stream(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<ProviderStream> {
        let events = match self.next_step(messages, tools)? {
            Step::Stream(events) => events,
            Step::Reply(reply) => {
                let reply = reply?;
                let mut events = Vec::new();
                if let Some(text) = reply.content.as_ref().filter(|t| !t.is_empty()) {
                    events.push(Ok(ProviderEvent::Token(text.clone())));
                }
                events.push(Ok(ProviderEvent::Done(reply)));
                events
            }
        };
        Ok(Box::pin(futures::stream::iter(events)))
    }
}
