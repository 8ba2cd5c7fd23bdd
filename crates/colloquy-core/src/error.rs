//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Backend returned neither text nor tool calls
    #[error("Empty response from provider")]
    EmptyResponse,

    /// Backend reported that the model produced unparseable output
    /// (e.g. a tool call whose arguments are not valid JSON)
    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    /// Media type the active model cannot process
    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    /// Model requested a tool that no source provides
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A connected capability server failed while forwarding a call
    #[error("External tool transport error ({server}): {message}")]
    ExternalToolTransport { server: String, message: String },

    /// Tool validation failed
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Errors the orchestration loop recovers from with its retry ladder
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::EmptyResponse | Self::MalformedOutput(_))
    }

    /// Errors scoped to a single tool call; these become tool-role results
    /// and never abort a turn.
    pub const fn is_tool_local(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool(_)
                | Self::ExternalToolTransport { .. }
                | Self::ToolValidation(_)
                | Self::ToolExecution(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::EmptyResponse | Self::MalformedOutput(_) => {
                "The AI service returned an unusable response. Please try again.".into()
            }
            Self::UnsupportedContent(msg) => {
                format!("The selected model cannot process this content: {msg}")
            }
            Self::UnknownTool(name) => format!("The tool '{name}' is not available."),
            Self::ExternalToolTransport { server, .. } => {
                format!("The tool server '{server}' is not responding.")
            }
            Self::ToolValidation(msg) => format!("Invalid tool input: {msg}"),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            Self::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_set() {
        assert!(AgentError::EmptyResponse.is_recoverable());
        assert!(AgentError::MalformedOutput("bad json".into()).is_recoverable());
        assert!(!AgentError::UnsupportedContent("image/tiff".into()).is_recoverable());
        assert!(!AgentError::Provider("500".into()).is_recoverable());
    }

    #[test]
    fn test_tool_local_errors() {
        assert!(AgentError::UnknownTool("nope".into()).is_tool_local());
        assert!(
            AgentError::ExternalToolTransport {
                server: "git".into(),
                message: "broken pipe".into(),
            }
            .is_tool_local()
        );
        assert!(!AgentError::EmptyResponse.is_tool_local());
    }
}
