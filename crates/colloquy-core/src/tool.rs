//! Tool System
//!
//! Tool calls, results and schemas, plus the [`Tool`] trait every executor
//! implements. Aggregation and dispatch live in [`crate::registry`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::Arc;

use crate::error::{AgentError, Result};

/// Structured tool arguments
pub type ToolArguments = Map<String, Value>;

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID; some providers never emit one, in which case results are
    /// correlated by tool name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Tool identifier
    pub name: String,

    /// Arguments, decoded from either a JSON object or a JSON-encoded string
    #[serde(default, deserialize_with = "deserialize_arguments")]
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Arguments as a JSON-encoded string, the shape OpenAI-style backends expect
    pub fn encoded_arguments(&self) -> String {
        encode_arguments(&self.arguments)
    }
}

/// Encode structured arguments as a JSON string
pub fn encode_arguments(arguments: &ToolArguments) -> String {
    Value::Object(arguments.clone()).to_string()
}

/// Decode a JSON-encoded argument string. Blank input is an empty map.
pub fn decode_arguments(raw: &str) -> Result<ToolArguments> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AgentError::MalformedOutput(format!("tool arguments are not valid JSON: {e}")))?;
    decode_argument_value(value)
}

/// Accept arguments in any shape a backend may transmit them
pub fn decode_argument_value(value: Value) -> Result<ToolArguments> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        Value::String(raw) => decode_arguments(&raw),
        other => Err(AgentError::MalformedOutput(format!(
            "tool arguments must be an object, got {other}"
        ))),
    }
}

fn deserialize_arguments<'de, D>(deserializer: D) -> std::result::Result<ToolArguments, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    decode_argument_value(value).map_err(serde::de::Error::custom)
}

/// Result from tool execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether execution succeeded
    pub success: bool,

    /// Output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(content: impl Into<Value>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
        }
    }

    /// JSON encoding stored as the tool-role message content
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({ "success": false, "error": format!("unserializable tool result: {e}") })
                .to_string()
        })
    }

    /// Human-readable output, cut to `max_chars`
    pub fn summary(&self, max_chars: usize) -> String {
        let text = match (&self.content, &self.error) {
            (_, Some(err)) if !self.success => format!("Error: {err}"),
            (Some(Value::String(s)), _) => s.clone(),
            (Some(v), _) => v.to_string(),
            (None, _) => String::new(),
        };
        truncate_chars(&text, max_chars)
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Parameter definition used by [`ToolSchemaBuilder`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, integer, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn new(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required,
            default: None,
            enum_values: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    fn to_property(&self) -> Value {
        let mut prop = json!({
            "type": self.param_type,
            "description": self.description,
        });
        if let Some(default) = &self.default {
            prop["default"] = default.clone();
        }
        if let Some(values) = &self.enum_values {
            prop["enum"] = Value::Array(values.clone());
        }
        prop
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// `{"type": "function", "function": {...}}` wire envelope
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolSchema,
}

impl ToolSchema {
    pub fn builder(name: impl Into<String>, description: impl Into<String>) -> ToolSchemaBuilder {
        ToolSchemaBuilder {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    /// Wrap in the function-calling envelope
    pub fn to_function_spec(&self) -> Value {
        json!({ "type": "function", "function": self })
    }

    /// Parse a function-calling envelope
    pub fn from_function_spec(value: Value) -> Result<Self> {
        let spec: FunctionSpec = serde_json::from_value(value)?;
        if spec.kind != "function" {
            return Err(AgentError::ToolValidation(format!(
                "unsupported tool spec type '{}'",
                spec.kind
            )));
        }
        Ok(spec.function)
    }

    /// Names listed under `required` in the parameter schema
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|req| req.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Explicit schema construction for runtime-registered tools
#[derive(Clone, Debug)]
pub struct ToolSchemaBuilder {
    name: String,
    description: String,
    params: Vec<ParameterSchema>,
}

impl ToolSchemaBuilder {
    pub fn param(
        self,
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.parameter(ParameterSchema::new(name, param_type, description, required))
    }

    pub fn parameter(mut self, param: ParameterSchema) -> Self {
        self.params.push(param);
        self
    }

    pub fn build(self) -> ToolSchema {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(param.name.clone(), param.to_property());
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        ToolSchema {
            name: self.name,
            description: self.description,
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with decoded arguments
    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult>;

    /// Validate arguments before execution
    fn validate(&self, arguments: &ToolArguments) -> Result<()> {
        let schema = self.schema();
        for name in schema.required_parameters() {
            if !arguments.contains_key(name) {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter '{name}' for tool '{}'",
                    schema.name
                )));
            }
        }
        Ok(())
    }
}

type Executor = Arc<dyn Fn(ToolArguments) -> BoxFuture<'static, Result<ToolResult>> + Send + Sync>;

/// A tool assembled from a schema and an async closure
pub struct FnTool {
    schema: ToolSchema,
    executor: Executor,
}

impl FnTool {
    pub fn new<F, Fut>(schema: ToolSchema, executor: F) -> Self
    where
        F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        Self {
            schema,
            executor: Arc::new(move |args| -> BoxFuture<'static, Result<ToolResult>> {
                Box::pin(executor(args))
            }),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        (self.executor)(arguments.clone()).await
    }
}
