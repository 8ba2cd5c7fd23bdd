//! Streaming protocol events
//!
//! What a streamed turn publishes to the transport. Serialized with a `type`
//! tag in snake_case (`token`, `thinking_delta`, `media_resolved`, ...).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{MediaItem, MediaKind};

/// One event of a streamed turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Visible text delta
    Token { content: String },
    ThinkingStart,
    /// Reasoning text delta
    ThinkingDelta { content: String },
    ThinkingEnd,
    ToolStart {
        tool: String,
        /// Truncated argument summary
        arguments: String,
    },
    ToolEnd {
        tool: String,
        success: bool,
        /// Truncated result summary
        result: String,
    },
    MediaResolved {
        query: String,
        kind: MediaKind,
        placeholder: String,
        results: Vec<MediaItem>,
    },
    /// Final answer text with reasoning removed
    Complete { content: String },
    Error { message: String },
}

/// The transport went away
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Destination of turn events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: TurnEvent) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for mpsc::Sender<TurnEvent> {
    async fn send(&self, event: TurnEvent) -> Result<(), SinkClosed> {
        Self::send(self, event).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<TurnEvent> {
    async fn send(&self, event: TurnEvent) -> Result<(), SinkClosed> {
        Self::send(self, event).map_err(|_| SinkClosed)
    }
}
