//! # colloquy-runtime
//!
//! Concrete backends for colloquy-core.
//!
//! ## Providers
//!
//! - **Ollama** (`/api/chat`, NDJSON streaming)
//! - **OpenAI** (`/chat/completions`, SSE streaming; any compatible server)
//! - **Anthropic** (`/v1/messages`, SSE streaming)
//!
//! Plus the stdio capability-server client, the default tool set and a
//! SearxNG media resolver.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colloquy_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()?;
//! let agent = AgentBuilder::new()
//!     .provider(config.build_provider()?)
//!     .tools(config.default_tools()?)
//!     .config(config.agent_config())
//!     .build()?;
//! ```

mod framing;

#[cfg(feature = "anthropic")]
pub mod anthropic;
pub mod config;
pub mod mcp;
#[cfg(feature = "ollama")]
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;
pub mod search;
pub mod tools;

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicProvider;
pub use config::{ProviderKind, RuntimeConfig};
pub use mcp::{ServerConfig, StdioServer};
#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;
#[cfg(feature = "openai")]
pub use openai::OpenAiProvider;
pub use search::SearxngClient;
pub use tools::Workspace;

// Re-export core types for convenience
pub use colloquy_core::{
    Agent, AgentBuilder, AgentError, LlmProvider, Message, Result, Role, Session, Tool, ToolRegistry,
};
