//! Anthropic LLM Provider
//!
//! Messages API (`/v1/messages`) adapter. System messages move to the
//! top-level `system` field, tool results travel as `tool_result` blocks in
//! user messages, and streamed tool input arrives as `input_json_delta`
//! fragments keyed by content-block index.

use std::time::Duration;

use async_trait::async_trait;
use colloquy_core::{
    error::{AgentError, Result},
    message::{Content, ContentPart, Message, Role},
    provider::{
        Capabilities, GenerationOptions, LlmProvider, NormalizedMessage, ProviderEvent,
        ProviderStream, ToolCallAccumulator, ToolCallDelta, check_media_support,
    },
    tool::{ToolCall, ToolSchema, decode_argument_value},
};
use serde_json::{Value, json};

use crate::framing::{self, LineDecoder, SseEvent, SseParser, reports_malformed_output};

const API_VERSION: &str = "2023-06-01";

/// Anthropic provider configuration
#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub generation: GenerationOptions,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".into(),
            api_key: String::new(),
            timeout_secs: 120,
            generation: GenerationOptions::for_model("claude-sonnet-4-20250514"),
        }
    }
}

/// Anthropic Messages API provider
pub struct AnthropicProvider {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn from_config(config: AnthropicConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::Config("Anthropic API key is required".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub const fn config(&self) -> &AnthropicConfig {
        &self.config
    }

    fn content_blocks(content: &Content) -> Vec<Value> {
        match content {
            Content::Text(text) if text.is_empty() => Vec::new(),
            Content::Text(text) => vec![json!({ "type": "text", "text": text })],
            Content::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::Image { data, mime_type } => json!({
                        "type": "image",
                        "source": { "type": "base64", "media_type": mime_type, "data": data },
                    }),
                })
                .collect(),
        }
    }

    /// Split out the system prompt and convert the rest. Consecutive tool
    /// results share one user message.
    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system = Vec::new();
        let mut converted: Vec<Value> = Vec::new();

        for m in messages {
            match m.role {
                Role::System => system.push(m.text()),
                Role::User => converted.push(json!({
                    "role": "user",
                    "content": Self::content_blocks(&m.content),
                })),
                Role::Assistant => {
                    let mut blocks = Self::content_blocks(&m.content);
                    blocks.extend(m.tool_calls.iter().map(|c| {
                        json!({
                            "type": "tool_use",
                            "id": c.id.clone().unwrap_or_else(|| c.name.clone()),
                            "name": c.name,
                            "input": c.arguments,
                        })
                    }));
                    converted.push(json!({ "role": "assistant", "content": blocks }));
                }
                Role::Tool => {
                    let text = m.text();
                    let failed = serde_json::from_str::<Value>(&text)
                        .is_ok_and(|v| v["success"] == Value::Bool(false));
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": m
                            .tool_call_id
                            .clone()
                            .or_else(|| m.tool_name.clone())
                            .unwrap_or_default(),
                        "content": text,
                        "is_error": failed,
                    });
                    let open = converted
                        .last_mut()
                        .filter(|last| last["role"] == "user" && last["content"][0]["type"] == "tool_result")
                        .and_then(|last| last["content"].as_array_mut());
                    match open {
                        Some(blocks) => blocks.push(block),
                        None => converted.push(json!({ "role": "user", "content": [block] })),
                    }
                }
            }
        }

        let system = (!system.is_empty()).then(|| system.join("\n\n"));
        (system, converted)
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSchema], stream: bool) -> Value {
        let opts = &self.config.generation;
        let (system, converted) = Self::convert_messages(messages);
        let mut body = json!({
            "model": opts.model,
            "messages": converted,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !opts.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(opts.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
                .collect();
        }
        body
    }

    async fn post_messages(&self, messages: &[Message], tools: &[ToolSchema], stream: bool) -> Result<reqwest::Response> {
        check_media_support(messages, &self.capabilities())?;
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        tracing::debug!(url = %url, model = %self.config.generation.model, tools = tools.len(), stream, "Anthropic request");
        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(messages, tools, stream));
        framing::send(request).await
    }
}

fn api_error(error: &Value) -> AgentError {
    let message = error["message"]
        .as_str()
        .map_or_else(|| error.to_string(), str::to_string);
    match error["type"].as_str() {
        Some("overloaded_error") => AgentError::ProviderUnavailable(message),
        Some("rate_limit_error") => AgentError::RateLimited(message),
        Some("authentication_error") => AgentError::Auth(message),
        _ if reports_malformed_output(&message) => AgentError::MalformedOutput(message),
        _ => AgentError::Provider(message),
    }
}

/// Normalize a non-streamed Messages API response
fn parse_message(value: &Value) -> Result<NormalizedMessage> {
    if value["type"] == "error" {
        return Err(api_error(&value["error"]));
    }

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in value["content"].as_array().into_iter().flatten() {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block["id"].as_str().map(str::to_string),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: decode_argument_value(block["input"].clone())?,
            }),
            _ => {}
        }
    }
    Ok(NormalizedMessage::new(
        Some(text).filter(|t| !t.is_empty()),
        tool_calls,
    ))
}

/// Decodes the Messages API event stream
#[derive(Debug, Default)]
struct EventDecoder {
    sse: SseParser,
    content: String,
    calls: ToolCallAccumulator,
    done: bool,
}

impl EventDecoder {
    fn decode_event(&mut self, event: &SseEvent) -> Result<Vec<ProviderEvent>> {
        let data: Value = serde_json::from_str(&event.data)
            .map_err(|e| AgentError::Provider(format!("invalid stream event: {e}")))?;
        let kind = event
            .event
            .as_deref()
            .or_else(|| data["type"].as_str())
            .unwrap_or_default();
        let index = data["index"]
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or(0);

        let mut events = Vec::new();
        match kind {
            "content_block_start" => {
                let block = &data["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(self.token(text));
                        }
                    }
                    Some("tool_use") => {
                        let delta = ToolCallDelta {
                            index,
                            id: block["id"].as_str().map(str::to_string),
                            name: block["name"].as_str().map(str::to_string),
                            arguments: String::new(),
                        };
                        self.calls.push(&delta);
                        events.push(ProviderEvent::ToolCallDelta(delta));
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(self.token(text));
                        }
                    }
                    Some("input_json_delta") => {
                        let delta = ToolCallDelta {
                            index,
                            arguments: delta["partial_json"].as_str().unwrap_or_default().to_string(),
                            ..Default::default()
                        };
                        self.calls.push(&delta);
                        events.push(ProviderEvent::ToolCallDelta(delta));
                    }
                    _ => {}
                }
            }
            "message_stop" => events.push(self.complete()?),
            "error" => return Err(api_error(&data["error"])),
            _ => tracing::trace!(kind, "Ignoring stream event"),
        }
        Ok(events)
    }

    fn token(&mut self, text: &str) -> ProviderEvent {
        self.content.push_str(text);
        ProviderEvent::Token(text.to_string())
    }

    fn complete(&mut self) -> Result<ProviderEvent> {
        self.done = true;
        let content = Some(std::mem::take(&mut self.content)).filter(|c| !c.is_empty());
        let tool_calls = std::mem::take(&mut self.calls).finish()?;
        Ok(ProviderEvent::Done(NormalizedMessage::new(content, tool_calls)))
    }
}

impl LineDecoder for EventDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<ProviderEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        match self.sse.push_line(line) {
            Some(event) => self.decode_event(&event),
            None => Ok(Vec::new()),
        }
    }

    fn finish(&mut self) -> Result<Vec<ProviderEvent>> {
        let mut events = match self.sse.flush() {
            Some(event) if !self.done => self.decode_event(&event)?,
            _ => Vec::new(),
        };
        if !self.done {
            tracing::debug!("Message stream ended without message_stop");
            events.push(self.complete()?);
        }
        Ok(events)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_vision: true,
            supports_streaming: true,
        }
    }

    async fn call(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<NormalizedMessage> {
        let response = self.post_messages(messages, tools, false).await?;
        let value: Value = response.json().await.map_err(|e| framing::request_error(&e))?;
        parse_message(&value)?.ensure_usable()
    }

    async fn stream(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<ProviderStream> {
        let response = self.post_messages(messages, tools, true).await?;
        Ok(framing::decode_body(response, EventDecoder::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::decode_text;
    use serde_json::Map;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::from_config(AnthropicConfig {
            api_key: "test-key".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_api_key_required() {
        assert!(matches!(
            AnthropicProvider::from_config(AnthropicConfig::default()),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_system_moves_to_top_level_and_results_merge() {
        let mut args = Map::new();
        args.insert("path".into(), json!("."));
        let messages = vec![
            Message::system("Be brief."),
            Message::user("List files and the time"),
            Message::assistant_with_tools(
                Some("Checking.".into()),
                vec![
                    ToolCall::new("list_directory", args).with_id("tu_1"),
                    ToolCall::new("current_time", Map::new()).with_id("tu_2"),
                ],
            ),
            Message::tool("{\"success\":true,\"content\":\"a.txt\"}", Some("tu_1".into()), "list_directory"),
            Message::tool("{\"success\":true,\"content\":\"noon\"}", Some("tu_2".into()), "current_time"),
        ];

        let body = provider().request_body(&messages, &[], false);
        assert_eq!(body["system"], "Be brief.");
        let converted = body["messages"].as_array().unwrap();
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[1]["content"][0]["text"], "Checking.");
        assert_eq!(converted[1]["content"][1]["type"], "tool_use");
        assert_eq!(converted[1]["content"][1]["input"]["path"], ".");
        assert_eq!(converted[2]["role"], "user");
        assert_eq!(converted[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(converted[2]["content"][1]["tool_use_id"], "tu_2");
        assert_eq!(converted[2]["content"][0]["is_error"], false);
    }

    #[test]
    fn test_image_blocks() {
        let (_, converted) = AnthropicProvider::convert_messages(&[Message::user_with_image(
            "what is it",
            "R0lG",
            "image/gif",
        )]);
        let image = &converted[0]["content"][1];
        assert_eq!(image["type"], "image");
        assert_eq!(image["source"]["media_type"], "image/gif");
        assert_eq!(image["source"]["data"], "R0lG");
    }

    #[test]
    fn test_tools_use_input_schema() {
        let schema = ToolSchema::builder("web_search", "Search")
            .param("query", "string", "Terms", true)
            .build();
        let body = provider().request_body(&[Message::user("hi")], &[schema], true);
        assert_eq!(body["tools"][0]["name"], "web_search");
        assert_eq!(body["tools"][0]["input_schema"]["required"][0], "query");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_message() {
        let value = json!({
            "type": "message",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"file_path": "a.txt"}}
            ],
            "stop_reason": "tool_use"
        });
        let reply = parse_message(&value).unwrap();
        assert_eq!(reply.content.as_deref(), Some("Let me look."));
        assert_eq!(reply.tool_calls[0].id.as_deref(), Some("tu_1"));
        assert_eq!(reply.tool_calls[0].arguments["file_path"], "a.txt");

        let overloaded = json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}});
        assert!(matches!(parse_message(&overloaded), Err(AgentError::ProviderUnavailable(_))));
    }

    #[test]
    fn test_stream_decoding() {
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Reading\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"tu_1\",\"name\":\"read_file\",\"input\":{}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"file_path\\\": \\\"a\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\".txt\\\"}\"}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        let events = decode_text(EventDecoder::default(), body).unwrap();
        assert_eq!(events[0], ProviderEvent::Token("Reading".into()));

        let reply = framing::final_reply(events).unwrap();
        assert_eq!(reply.content.as_deref(), Some("Reading"));
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].id.as_deref(), Some("tu_1"));
        assert_eq!(reply.tool_calls[0].arguments["file_path"], "a.txt");
    }

    #[test]
    fn test_stream_error_event() {
        let body = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"rate_limit_error\",\"message\":\"slow\"}}\n\n";
        assert!(matches!(
            decode_text(EventDecoder::default(), body),
            Err(AgentError::RateLimited(_))
        ));
    }
}
