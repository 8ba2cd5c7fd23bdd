//! OpenAI-compatible LLM Provider
//!
//! Talks to any `/v1/chat/completions` endpoint (OpenAI, vLLM, LM Studio,
//! llama.cpp server, ...). Tool-call arguments travel as JSON-encoded
//! strings; streamed calls arrive as per-index fragments.

use std::time::Duration;

use async_trait::async_trait;
use colloquy_core::{
    error::{AgentError, Result},
    message::{ContentPart, Content, Message, Role},
    provider::{
        Capabilities, GenerationOptions, LlmProvider, NormalizedMessage, ProviderEvent,
        ProviderStream, ToolCallAccumulator, ToolCallDelta, check_media_support,
    },
    tool::{ToolCall, ToolSchema, decode_argument_value},
};
use serde_json::{Value, json};

use crate::framing::{self, LineDecoder, SseParser, reports_malformed_output};

/// OpenAI-compatible provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL up to and including `/v1`
    pub base_url: String,

    /// Bearer token; local servers usually need none
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    pub generation: GenerationOptions,

    pub supports_vision: bool,

    pub supports_tools: bool,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            timeout_secs: 120,
            generation: GenerationOptions::for_model("gpt-4o-mini"),
            supports_vision: true,
            supports_tools: true,
        }
    }
}

/// OpenAI-compatible chat completions provider
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub const fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn convert_content(content: &Content) -> Value {
        match content {
            Content::Text(text) => json!(text),
            Content::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::Image { data, mime_type } => json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:{mime_type};base64,{data}") },
                    }),
                })
                .collect(),
        }
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::Assistant if m.has_tool_calls() => {
                    let text = m.text();
                    json!({
                        "role": "assistant",
                        "content": if text.is_empty() { Value::Null } else { json!(text) },
                        "tool_calls": m.tool_calls.iter().map(|c| json!({
                            "id": c.id.clone().unwrap_or_else(|| c.name.clone()),
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.encoded_arguments() },
                        })).collect::<Vec<_>>(),
                    })
                }
                Role::Tool => json!({
                    "role": "tool",
                    "tool_call_id": m
                        .tool_call_id
                        .clone()
                        .or_else(|| m.tool_name.clone())
                        .unwrap_or_default(),
                    "content": m.text(),
                }),
                role => json!({
                    "role": role.to_string(),
                    "content": Self::convert_content(&m.content),
                }),
            })
            .collect()
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSchema], stream: bool) -> Value {
        let opts = &self.config.generation;
        let mut body = json!({
            "model": opts.model,
            "messages": Self::convert_messages(messages),
            "temperature": opts.temperature,
            "top_p": opts.top_p,
            "max_tokens": opts.max_tokens,
            "stream": stream,
        });
        if !opts.stop_sequences.is_empty() {
            body["stop"] = json!(opts.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(ToolSchema::to_function_spec).collect();
        }
        body
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_completions(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        stream: bool,
    ) -> Result<reqwest::Response> {
        check_media_support(messages, &self.capabilities())?;
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        tracing::debug!(url = %url, model = %self.config.generation.model, tools = tools.len(), stream, "OpenAI request");
        let request = self
            .client
            .post(&url)
            .json(&self.request_body(messages, tools, stream));
        framing::send(self.authorized(request)).await
    }
}

fn api_error(error: &Value) -> AgentError {
    let message = error["message"]
        .as_str()
        .map_or_else(|| error.to_string(), str::to_string);
    if reports_malformed_output(&error.to_string()) {
        AgentError::MalformedOutput(message)
    } else {
        AgentError::Provider(message)
    }
}

/// Normalize a non-streamed completion
fn parse_completion(value: &Value) -> Result<NormalizedMessage> {
    if let Some(error) = value.get("error") {
        return Err(api_error(error));
    }
    let message = &value["choices"][0]["message"];
    if message.is_null() {
        return Err(AgentError::Provider("completion has no choices".into()));
    }

    let content = message["content"]
        .as_str()
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|call| -> Result<ToolCall> {
                    let function = &call["function"];
                    Ok(ToolCall {
                        id: call["id"].as_str().map(str::to_string),
                        name: function["name"].as_str().unwrap_or_default().to_string(),
                        arguments: decode_argument_value(function["arguments"].clone())?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(NormalizedMessage::new(content, tool_calls))
}

/// Decodes `data:` chunks of a streamed completion
#[derive(Debug, Default)]
struct ChunkDecoder {
    sse: SseParser,
    content: String,
    calls: ToolCallAccumulator,
    done: bool,
}

impl ChunkDecoder {
    fn decode_data(&mut self, data: &str) -> Result<Vec<ProviderEvent>> {
        if data.trim() == "[DONE]" {
            return self.complete().map(|done| vec![done]);
        }
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| AgentError::Provider(format!("invalid completion chunk: {e}")))?;
        if let Some(error) = chunk.get("error") {
            return Err(api_error(error));
        }

        let mut events = Vec::new();
        let delta = &chunk["choices"][0]["delta"];
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            self.content.push_str(text);
            events.push(ProviderEvent::Token(text.to_string()));
        }
        for fragment in delta["tool_calls"].as_array().into_iter().flatten() {
            let function = &fragment["function"];
            let delta = ToolCallDelta {
                index: fragment["index"]
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .unwrap_or(0),
                id: fragment["id"].as_str().map(str::to_string),
                name: function["name"].as_str().map(str::to_string),
                arguments: function["arguments"].as_str().unwrap_or_default().to_string(),
            };
            self.calls.push(&delta);
            events.push(ProviderEvent::ToolCallDelta(delta));
        }
        Ok(events)
    }

    fn complete(&mut self) -> Result<ProviderEvent> {
        self.done = true;
        let content = Some(std::mem::take(&mut self.content)).filter(|c| !c.is_empty());
        let tool_calls = std::mem::take(&mut self.calls).finish()?;
        Ok(ProviderEvent::Done(NormalizedMessage::new(content, tool_calls)))
    }
}

impl LineDecoder for ChunkDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<ProviderEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        match self.sse.push_line(line) {
            Some(event) => self.decode_data(&event.data),
            None => Ok(Vec::new()),
        }
    }

    fn finish(&mut self) -> Result<Vec<ProviderEvent>> {
        let mut events = match self.sse.flush() {
            Some(event) if !self.done => self.decode_data(&event.data)?,
            _ => Vec::new(),
        };
        if !self.done {
            tracing::debug!("Completion stream ended without [DONE]");
            events.push(self.complete()?);
        }
        Ok(events)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: self.config.supports_tools,
            supports_vision: self.config.supports_vision,
            supports_streaming: true,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        match framing::send(self.authorized(self.client.get(&url))).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "OpenAI health check failed");
                Ok(false)
            }
        }
    }

    async fn call(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<NormalizedMessage> {
        let response = self.post_completions(messages, tools, false).await?;
        let value: Value = response.json().await.map_err(|e| framing::request_error(&e))?;
        parse_completion(&value)?.ensure_usable()
    }

    async fn stream(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<ProviderStream> {
        let response = self.post_completions(messages, tools, true).await?;
        Ok(framing::decode_body(response, ChunkDecoder::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::decode_text;
    use serde_json::Map;

    #[test]
    fn test_message_conversion() {
        let mut args = Map::new();
        args.insert("query".into(), json!("rust"));
        let messages = vec![
            Message::system("sys"),
            Message::user_with_image("see", "AAAA", "image/jpeg"),
            Message::assistant_with_tools(None, vec![ToolCall::new("web_search", args).with_id("call_9")]),
            Message::tool("{\"success\":true}", Some("call_9".into()), "web_search"),
            Message::tool("{\"success\":true}", None, "current_time"),
        ];
        let converted = OpenAiProvider::convert_messages(&messages);

        assert_eq!(converted[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(
            converted[1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
        assert_eq!(converted[2]["content"], Value::Null);
        assert_eq!(
            converted[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"query":"rust"}"#
        );
        assert_eq!(converted[3]["tool_call_id"], "call_9");
        assert_eq!(converted[4]["tool_call_id"], "current_time");
    }

    #[test]
    fn test_parse_completion() {
        let value = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"file_path\":\"a.txt\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let reply = parse_completion(&value).unwrap();
        assert_eq!(reply.content, None);
        assert_eq!(reply.tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(reply.tool_calls[0].arguments["file_path"], "a.txt");

        let bad_args = json!({
            "choices": [{"message": {"tool_calls": [{"function": {"name": "x", "arguments": "{oops"}}]}}]
        });
        assert!(matches!(parse_completion(&bad_args), Err(AgentError::MalformedOutput(_))));
    }

    #[test]
    fn test_stream_decoding_with_tool_fragments() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Let me check\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"read_file\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"file_path\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"a.txt\\\"}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let events = decode_text(ChunkDecoder::default(), body).unwrap();
        assert_eq!(events[0], ProviderEvent::Token("Let me check".into()));

        let reply = framing::final_reply(events).unwrap();
        assert_eq!(reply.content.as_deref(), Some("Let me check"));
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "read_file");
        assert_eq!(reply.tool_calls[0].arguments["file_path"], "a.txt");
    }

    #[test]
    fn test_stream_error_chunk() {
        let body = "data: {\"error\":{\"message\":\"Failed to parse tool call arguments\",\"code\":\"tool_use_failed\"}}\n\n";
        let result = decode_text(ChunkDecoder::default(), body);
        assert!(matches!(result, Err(AgentError::MalformedOutput(_))));
    }

    #[test]
    fn test_stream_without_done_marker() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}";
        let events = decode_text(ChunkDecoder::default(), body).unwrap();
        let reply = framing::final_reply(events).unwrap();
        assert_eq!(reply.content.as_deref(), Some("hi"));
    }
}
