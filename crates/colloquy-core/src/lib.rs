//! # colloquy-core
//!
//! Tool-calling conversation core with a provider-agnostic LLM contract.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Agent                               │
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────────────────┐  │
//! │  │  Reasoning  │  │ ToolRegistry │  │      LlmProvider        │  │
//! │  │    Loop     │──│ + Approval   │──│      (Strategy)         │  │
//! │  └──────┬──────┘  └──────────────┘  └─────────────────────────┘  │
//! │         │ tokens                                                 │
//! │  ┌──────┴──────┐   media intents   ┌─────────────────────────┐   │
//! │  │   Stream    │──────────────────>│ MediaResolver (tasks)   │   │
//! │  │   Decoder   │                   └─────────────────────────┘   │
//! │  └─────────────┘                                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between Ollama, OpenAI, Anthropic,
//! or any other backend without changing the loop. Sessions are passed in per
//! turn through [`TurnContext`]; the agent itself holds no session state.

pub mod approval;
pub mod error;
pub mod events;
pub mod media;
pub mod message;
pub mod mock;
pub mod provider;
pub mod reasoning;
pub mod registry;
pub mod session;
pub mod stream;
pub mod tool;

pub use approval::{ApprovalConfig, ApprovalDecision, ApprovalGate, ApprovalHandler, UnattendedApproval};
pub use error::{AgentError, Result};
pub use events::{EventSink, TurnEvent};
pub use media::{MediaItem, MediaKind, MediaResolver, PendingMedia};
pub use message::{Content, ContentPart, Conversation, Message, Role};
pub use provider::{Capabilities, LlmProvider, NormalizedMessage, ProviderEvent, ProviderStream};
pub use reasoning::{Agent, AgentBuilder, AgentConfig, StreamedTurn, TurnContext, TurnObserver};
pub use registry::{CapabilityServer, ReplySegment, ServerReply, ToolRegistry, ToolSource};
pub use session::{MemorySessionStore, Session, SessionId, SessionStore, TurnId};
pub use stream::{StreamDecoder, split_reasoning};
pub use tool::{Tool, ToolArguments, ToolCall, ToolResult, ToolSchema};
