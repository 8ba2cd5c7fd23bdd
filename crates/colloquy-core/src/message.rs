//! Conversation Messages
//!
//! Canonical message format shared by the loop, the tool dispatcher and every
//! provider adapter. Adapters translate *from* this shape; nothing upstream of
//! them sees a backend-specific message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One typed part of a multimodal message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Image bytes, base64-encoded
    Image {
        data: String,
        mime_type: String,
    },
}

/// Message body: plain text or an ordered list of parts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl Content {
    /// Text of the message with all image parts dropped
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// `(base64 data, mime type)` of every image part
    pub fn images(&self) -> impl Iterator<Item = (&str, &str)> {
        let parts: &[ContentPart] = match self {
            Self::Text(_) => &[],
            Self::Parts(parts) => parts,
        };
        parts.iter().filter_map(|p| match p {
            ContentPart::Image { data, mime_type } => Some((data.as_str(), mime_type.as_str())),
            ContentPart::Text { .. } => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text or multimodal content
    #[serde(default)]
    pub content: Content,

    /// Tool calls requested by the model (assistant messages only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Correlates a tool result with the call that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Name of the tool that produced this result (tool messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a user message carrying text plus one image
    pub fn user_with_image(
        text: impl Into<String>,
        data: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self::new(
            Role::User,
            Content::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::Image {
                    data: data.into(),
                    mime_type: mime_type.into(),
                },
            ]),
        )
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message that requests tool calls
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content.unwrap_or_default());
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a tool result message
    pub fn tool(
        content: impl Into<Content>,
        tool_call_id: Option<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = tool_call_id;
        msg.tool_name = Some(tool_name.into());
        msg
    }

    /// Flattened text content
    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u32 {
        // ~4 characters per token is a rough estimate
        u32::try_from(self.text().len() / 4).unwrap_or(u32::MAX) + 4 // +4 for role overhead
    }
}

/// Ordered transcript of one session.
///
/// The first message is the system prompt; [`Conversation::clear_history`]
/// keeps it and drops everything else.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut conv = Self::new();
        conv.push(Message::system(prompt.into()));
        conv
    }

    /// Insert a system prompt at the head unless one is already there
    pub fn ensure_system_prompt(&mut self, prompt: &str) {
        if self.messages.first().map(|m| m.role) != Some(Role::System) {
            self.messages.insert(0, Message::system(prompt));
        }
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Drop everything except the leading system prompt
    pub fn clear_history(&mut self) {
        let keep = usize::from(self.messages.first().map(|m| m.role) == Some(Role::System));
        self.messages.truncate(keep);
    }

    /// Estimate total tokens in conversation
    pub fn estimate_tokens(&self) -> u32 {
        self.messages.iter().map(Message::estimate_tokens).sum()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn test_conversation() {
        let mut conv = Conversation::with_system_prompt("You are helpful.");
        conv.push(Message::user("Hi"));
        conv.push(Message::assistant("Hello!"));

        assert_eq!(conv.len(), 3);
        assert!(conv.last().unwrap().role == Role::Assistant);
    }

    #[test]
    fn test_clear_keeps_only_system_prompt() {
        let mut conv = Conversation::with_system_prompt("sys");
        conv.push(Message::user("a"));
        conv.push(Message::assistant("b"));
        conv.push(Message::system("late system note"));
        conv.clear_history();

        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.messages()[0].text(), "sys");
    }

    #[test]
    fn test_ensure_system_prompt_is_idempotent() {
        let mut conv = Conversation::new();
        conv.push(Message::user("hi"));
        conv.ensure_system_prompt("sys");
        conv.ensure_system_prompt("other");

        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].text(), "sys");
    }

    #[test]
    fn test_multimodal_content() {
        let msg = Message::user_with_image("what is this?", "aGVsbG8=", "image/png");
        assert_eq!(msg.text(), "what is this?");
        let images: Vec<_> = msg.content.images().collect();
        assert_eq!(images, vec![("aGVsbG8=", "image/png")]);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][1]["type"], "image");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.content, msg.content);
    }

    #[test]
    fn test_tool_message_correlation_fields() {
        let msg = Message::tool("{}", Some("call_1".into()), "read_file");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.tool_name.as_deref(), Some("read_file"));
    }
}
