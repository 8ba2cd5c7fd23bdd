//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for all LLM backends (Ollama, OpenAI-compatible,
//! Anthropic, ...). Every adapter returns the same [`NormalizedMessage`], so
//! nothing above this layer branches on backend identity.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colloquy_core::provider::LlmProvider;
//!
//! let provider = OllamaProvider::new(config);
//! let reply = provider.call(&messages, &schemas).await?;
//! ```

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};
use crate::tool::{ToolCall, ToolSchema, decode_arguments};

/// Image mime types adapters accept when the model supports vision
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Configuration for LLM generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier (e.g., "llama3.2", "gpt-4o", "claude-sonnet-4")
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Top-p nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

const fn default_temperature() -> f32 {
    0.7
}
const fn default_max_tokens() -> u32 {
    2048
}
const fn default_top_p() -> f32 {
    0.9
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            stop_sequences: Vec::new(),
        }
    }
}

impl GenerationOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// What the configured backend/model can do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub supports_streaming: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_tools: true,
            supports_vision: false,
            supports_streaming: true,
        }
    }
}

/// Canonical assistant reply produced by every adapter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Always [`Role::Assistant`]
    pub role: Role,
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl NormalizedMessage {
    pub const fn new(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(Some(content.into()), Vec::new())
    }

    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self::new(None, tool_calls)
    }

    /// Neither text nor tool calls
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.content.as_deref().is_none_or(|c| c.trim().is_empty())
    }

    /// Reject empty replies with [`AgentError::EmptyResponse`]
    pub fn ensure_usable(self) -> Result<Self> {
        if self.is_empty() {
            Err(AgentError::EmptyResponse)
        } else {
            Ok(self)
        }
    }

    pub fn into_message(self) -> Message {
        Message::assistant_with_tools(self.content, self.tool_calls)
    }
}

/// Fragment of a streamed tool call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    /// Position of the call within the reply
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    /// Partial JSON argument text
    pub arguments: String,
}

/// Event on a provider's streaming feed
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    /// Raw text delta, reasoning tags included
    Token(String),
    ToolCallDelta(ToolCallDelta),
    /// Final normalized reply; always the last event
    Done(NormalizedMessage),
}

/// Stream type for streaming calls
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. "ollama")
    fn name(&self) -> &str;

    /// Capabilities of the configured model
    fn capabilities(&self) -> Capabilities;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// One batch call
    async fn call(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<NormalizedMessage>;

    /// Streaming call. Backends without native streaming replay the batch
    /// reply as a single token.
    async fn stream(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<ProviderStream> {
        let reply = self.call(messages, tools).await?;
        let mut events = Vec::new();
        if let Some(text) = reply.content.as_ref().filter(|t| !t.is_empty()) {
            events.push(Ok(ProviderEvent::Token(text.clone())));
        }
        events.push(Ok(ProviderEvent::Done(reply)));
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// Drain a provider stream and return its final reply
pub async fn collect_stream(mut stream: ProviderStream) -> Result<NormalizedMessage> {
    while let Some(event) = stream.next().await {
        if let ProviderEvent::Done(reply) = event? {
            return Ok(reply);
        }
    }
    Err(AgentError::Provider("stream ended without a final message".into()))
}

/// Fail with [`AgentError::UnsupportedContent`] if any image cannot be sent
pub fn check_media_support(messages: &[Message], capabilities: &Capabilities) -> Result<()> {
    for message in messages {
        for (_, mime_type) in message.content.images() {
            if !capabilities.supports_vision {
                return Err(AgentError::UnsupportedContent(format!(
                    "model does not accept images ({mime_type})"
                )));
            }
            if !SUPPORTED_IMAGE_TYPES.contains(&mime_type) {
                return Err(AgentError::UnsupportedContent(format!(
                    "image type {mime_type} is not supported"
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reassembles tool calls from streamed fragments, keyed by call index
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let Some(id) = &delta.id {
            call.id = Some(id.clone());
        }
        if let Some(name) = &delta.name {
            call.name.push_str(name);
        }
        call.arguments.push_str(&delta.arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Decode accumulated argument strings, in index order
    pub fn finish(self) -> Result<Vec<ToolCall>> {
        self.calls
            .into_values()
            .map(|call| {
                let arguments = decode_arguments(&call.arguments)?;
                Ok(ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl LlmProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_streaming: false,
                ..Default::default()
            }
        }

        async fn call(&self, messages: &[Message], _tools: &[ToolSchema]) -> Result<NormalizedMessage> {
            let last = messages.last().map(Message::text).unwrap_or_default();
            NormalizedMessage::text(last).ensure_usable()
        }
    }

    #[test]
    fn test_generation_options_defaults() {
        let opts = GenerationOptions::default();
        assert!((opts.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(opts.max_tokens, 2048);
        assert_eq!(opts.model, "llama3.2");
    }

    #[test]
    fn test_empty_reply_detection() {
        assert!(NormalizedMessage::new(None, vec![]).is_empty());
        assert!(NormalizedMessage::text("  \n").is_empty());
        assert!(!NormalizedMessage::text("4").is_empty());
        assert!(
            !NormalizedMessage::tool_calls(vec![ToolCall::new("x", serde_json::Map::new())])
                .is_empty()
        );
        assert!(matches!(
            NormalizedMessage::new(None, vec![]).ensure_usable(),
            Err(AgentError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn test_default_stream_replays_call() {
        let stream = Echo.stream(&[Message::user("ping")], &[]).await.unwrap();
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(ProviderEvent::Token(t)) if t == "ping"));

        let stream = Echo.stream(&[Message::user("pong")], &[]).await.unwrap();
        let reply = collect_stream(stream).await.unwrap();
        assert_eq!(reply.content.as_deref(), Some("pong"));
    }

    #[test]
    fn test_tool_call_accumulator() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&ToolCallDelta {
            index: 1,
            id: Some("call_b".into()),
            name: Some("list_directory".into()),
            arguments: String::new(),
        });
        acc.push(&ToolCallDelta {
            index: 0,
            id: Some("call_a".into()),
            name: Some("read_file".into()),
            arguments: "{\"file_pa".into(),
        });
        acc.push(&ToolCallDelta {
            index: 0,
            arguments: "th\": \"a.txt\"}".into(),
            ..Default::default()
        });

        let calls = acc.finish().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["file_path"], json!("a.txt"));
        assert_eq!(calls[1].id.as_deref(), Some("call_b"));
        assert!(calls[1].arguments.is_empty());
    }

    #[test]
    fn test_media_support_checks() {
        let png = [Message::user_with_image("look", "AAAA", "image/png")];
        let tiff = [Message::user_with_image("look", "AAAA", "image/tiff")];
        let vision = Capabilities {
            supports_vision: true,
            ..Default::default()
        };

        assert!(check_media_support(&png, &vision).is_ok());
        assert!(matches!(
            check_media_support(&png, &Capabilities::default()),
            Err(AgentError::UnsupportedContent(_))
        ));
        assert!(matches!(
            check_media_support(&tiff, &vision),
            Err(AgentError::UnsupportedContent(_))
        ));
        assert!(check_media_support(&[Message::user("text only")], &Capabilities::default()).is_ok());
    }
}
