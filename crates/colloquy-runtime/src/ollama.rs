//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference over the native
//! `/api/chat` endpoint. Streaming responses are NDJSON, one object per line.

use std::time::Duration;

use async_trait::async_trait;
use colloquy_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Capabilities, GenerationOptions, LlmProvider, NormalizedMessage, ProviderEvent,
        ProviderStream, ToolCallDelta, check_media_support,
    },
    tool::{ToolCall, ToolSchema, decode_argument_value, encode_arguments},
};
use serde_json::{Value, json};

use crate::framing::{self, LineDecoder, reports_malformed_output};

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Model and sampling options
    pub generation: GenerationOptions,

    /// Whether the model accepts images
    pub supports_vision: bool,

    /// Whether the model was trained for tool calling
    pub supports_tools: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            timeout_secs: 120,
            generation: GenerationOptions::default(),
            supports_vision: false,
            supports_tools: true,
        }
    }
}

impl OllamaConfig {
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> Result<Self> {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            generation: GenerationOptions::for_model(model),
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create with default localhost settings
    pub fn localhost() -> Result<Self> {
        Self::from_config(OllamaConfig::default())
    }

    pub const fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Convert agent messages to Ollama format
    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let mut msg = json!({
                    "role": m.role.to_string(),
                    "content": m.text(),
                });
                let images: Vec<&str> = m.content.images().map(|(data, _)| data).collect();
                if !images.is_empty() {
                    msg["images"] = json!(images);
                }
                if m.role == Role::Assistant && m.has_tool_calls() {
                    msg["tool_calls"] = m
                        .tool_calls
                        .iter()
                        .map(|c| json!({ "function": { "name": c.name, "arguments": c.arguments } }))
                        .collect();
                }
                if let Some(name) = m.tool_name.as_ref().filter(|_| m.role == Role::Tool) {
                    msg["tool_name"] = json!(name);
                }
                msg
            })
            .collect()
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSchema], stream: bool) -> Value {
        let opts = &self.config.generation;
        let mut body = json!({
            "model": opts.model,
            "messages": Self::convert_messages(messages),
            "stream": stream,
            "options": {
                "temperature": opts.temperature,
                "top_p": opts.top_p,
                "num_predict": opts.max_tokens,
            },
        });
        if !opts.stop_sequences.is_empty() {
            body["options"]["stop"] = json!(opts.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(ToolSchema::to_function_spec).collect();
        }
        body
    }

    async fn post_chat(&self, messages: &[Message], tools: &[ToolSchema], stream: bool) -> Result<reqwest::Response> {
        check_media_support(messages, &self.capabilities())?;
        let url = format!("{}/api/chat", self.config.base_url());
        tracing::debug!(url = %url, model = %self.config.generation.model, tools = tools.len(), stream, "Ollama request");
        framing::send(self.client.post(&url).json(&self.request_body(messages, tools, stream))).await
    }
}

/// Decodes `/api/chat` objects, streamed or not
#[derive(Debug, Default)]
struct ChatDecoder {
    content: String,
    tool_calls: Vec<ToolCall>,
    done: bool,
}

impl ChatDecoder {
    fn decode_value(&mut self, value: &Value) -> Result<Vec<ProviderEvent>> {
        if let Some(error) = value.get("error") {
            let message = error.as_str().map_or_else(|| error.to_string(), str::to_string);
            return Err(if reports_malformed_output(&message) {
                AgentError::MalformedOutput(message)
            } else {
                AgentError::Provider(message)
            });
        }

        let mut events = Vec::new();
        let message = &value["message"];
        if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
            self.content.push_str(text);
            events.push(ProviderEvent::Token(text.to_string()));
        }
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let function = &call["function"];
                let name = function["name"].as_str().unwrap_or_default().to_string();
                let arguments = decode_argument_value(function["arguments"].clone())?;
                let id = call["id"].as_str().map(str::to_string);
                events.push(ProviderEvent::ToolCallDelta(ToolCallDelta {
                    index: self.tool_calls.len(),
                    id: id.clone(),
                    name: Some(name.clone()),
                    arguments: encode_arguments(&arguments),
                }));
                self.tool_calls.push(ToolCall { id, name, arguments });
            }
        }
        if value["done"].as_bool() == Some(true) {
            events.push(self.complete());
        }
        Ok(events)
    }

    fn complete(&mut self) -> ProviderEvent {
        self.done = true;
        let content = Some(std::mem::take(&mut self.content)).filter(|c| !c.is_empty());
        ProviderEvent::Done(NormalizedMessage::new(content, std::mem::take(&mut self.tool_calls)))
    }
}

impl LineDecoder for ChatDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<ProviderEvent>> {
        if line.trim().is_empty() || self.done {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| AgentError::Provider(format!("invalid Ollama stream line: {e}")))?;
        self.decode_value(&value)
    }

    fn finish(&mut self) -> Result<Vec<ProviderEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        tracing::debug!("Ollama stream ended without a done marker");
        Ok(vec![self.complete()])
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: self.config.supports_tools,
            supports_vision: self.config.supports_vision,
            supports_streaming: true,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.config.base_url());
        match framing::send(self.client.get(&url)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "Ollama health check failed");
                Ok(false)
            }
        }
    }

    async fn call(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<NormalizedMessage> {
        let response = self.post_chat(messages, tools, false).await?;
        let value: Value = response.json().await.map_err(|e| framing::request_error(&e))?;

        let mut decoder = ChatDecoder::default();
        let mut events = decoder.decode_value(&value)?;
        events.extend(decoder.finish()?);
        framing::final_reply(events)?.ensure_usable()
    }

    async fn stream(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<ProviderStream> {
        let response = self.post_chat(messages, tools, true).await?;
        Ok(framing::decode_body(response, ChatDecoder::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::decode_text;
    use serde_json::Map;

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_message_conversion() {
        let mut args = Map::new();
        args.insert("file_path".into(), json!("a.txt"));
        let messages = vec![
            Message::system("You are helpful."),
            Message::user_with_image("What is this?", "iVBOR", "image/png"),
            Message::assistant_with_tools(None, vec![ToolCall::new("read_file", args)]),
            Message::tool("{\"success\":true}", None, "read_file"),
        ];

        let converted = OllamaProvider::convert_messages(&messages);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[0]["role"], "system");
        assert_eq!(converted[1]["images"], json!(["iVBOR"]));
        assert_eq!(converted[1]["content"], "What is this?");
        assert_eq!(
            converted[2]["tool_calls"][0]["function"]["arguments"]["file_path"],
            "a.txt"
        );
        assert_eq!(converted[3]["role"], "tool");
        assert_eq!(converted[3]["tool_name"], "read_file");
    }

    #[test]
    fn test_request_body_includes_tools() {
        let provider = OllamaProvider::localhost().unwrap();
        let schema = ToolSchema::builder("current_time", "Now").build();
        let body = provider.request_body(&[Message::user("hi")], &[schema], true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "current_time");

        let bare = provider.request_body(&[Message::user("hi")], &[], false);
        assert!(bare.get("tools").is_none());
    }

    #[test]
    fn test_stream_decoding() {
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":"lo"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":3}"#, "\n",
        );
        let events = decode_text(ChatDecoder::default(), body).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ProviderEvent::Token("Hel".into()));
        let ProviderEvent::Done(reply) = &events[2] else {
            panic!("expected done, got {:?}", events[2]);
        };
        assert_eq!(reply.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_tool_call_decoding() {
        let body = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"read_file","arguments":{"file_path":"a.txt"}}}]},"done":true}"#;
        let events = decode_text(ChatDecoder::default(), body).unwrap();
        let reply = framing::final_reply(events).unwrap();
        assert_eq!(reply.content, None);
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "read_file");
        assert_eq!(reply.tool_calls[0].arguments["file_path"], "a.txt");
        assert_eq!(reply.tool_calls[0].id, None);
    }

    #[test]
    fn test_error_lines() {
        let malformed = decode_text(
            ChatDecoder::default(),
            r#"{"error":"error parsing tool call: raw='{\"x\"'"}"#,
        );
        assert!(matches!(malformed, Err(AgentError::MalformedOutput(_))));

        let other = decode_text(ChatDecoder::default(), r#"{"error":"model 'nope' not found"}"#);
        assert!(matches!(other, Err(AgentError::Provider(_))));
    }

    #[test]
    fn test_truncated_stream_still_completes() {
        let events = decode_text(
            ChatDecoder::default(),
            r#"{"message":{"content":"partial"},"done":false}"#,
        )
        .unwrap();
        let reply = framing::final_reply(events).unwrap();
        assert_eq!(reply.content.as_deref(), Some("partial"));
    }
}
