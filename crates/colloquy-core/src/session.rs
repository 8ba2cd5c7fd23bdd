//! Session Management
//!
//! Sessions hold the transcript and the per-turn records that background
//! media resolution patches after a turn has been persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::media::MediaAttachment;
use crate::message::{Conversation, Role};

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one turn within a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping for one turn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: TurnId,
    pub started_at: DateTime<Utc>,
    /// Set once all synchronous work of the turn has finished
    pub committed: bool,
    /// Media resolved for markers in this turn's answer
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
}

/// Session metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Session title (auto-generated or user-set)
    pub title: Option<String>,

    /// User/owner ID
    pub user_id: Option<String>,

    /// Custom tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Extra key-value metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One logical conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Conversation history
    pub conversation: Conversation,

    /// Session metadata
    pub metadata: SessionMetadata,

    /// Turn records, oldest first
    #[serde(default)]
    pub turns: Vec<TurnRecord>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    /// Create with specific ID
    pub fn with_id(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation: Conversation::new(),
            metadata: SessionMetadata::default(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create with system prompt
    pub fn with_system_prompt(id: SessionId, system_prompt: impl Into<String>) -> Self {
        let mut session = Self::with_id(id);
        session.conversation = Conversation::with_system_prompt(system_prompt);
        session
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set session title
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.metadata.title = Some(title.into());
        self.touch();
    }

    /// Get or generate title
    pub fn title(&self) -> String {
        self.metadata.title.clone().unwrap_or_else(|| {
            // Generate from first user message
            self.conversation
                .messages()
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| {
                    let text = m.text();
                    let preview: String = text.chars().take(50).collect();
                    if text.chars().count() > 50 {
                        format!("{preview}...")
                    } else {
                        preview
                    }
                })
                .unwrap_or_else(|| {
                    let prefix: String = self.id.as_str().chars().take(8).collect();
                    format!("Session {prefix}")
                })
        })
    }

    /// Drop all messages except the system prompt
    pub fn clear(&mut self) {
        self.conversation.clear_history();
        self.touch();
    }

    /// Open a new, uncommitted turn record
    pub fn begin_turn(&mut self) -> TurnId {
        let id = TurnId::new();
        self.turns.push(TurnRecord {
            id,
            started_at: Utc::now(),
            committed: false,
            media: Vec::new(),
        });
        self.touch();
        id
    }

    pub fn turn(&self, id: TurnId) -> Option<&TurnRecord> {
        self.turns.iter().find(|t| t.id == id)
    }

    fn turn_mut(&mut self, id: TurnId) -> Result<&mut TurnRecord> {
        self.turns
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| AgentError::Session(format!("unknown turn {id}")))
    }

    /// Mark a turn's synchronous work as finished
    pub fn mark_committed(&mut self, id: TurnId) -> Result<()> {
        self.turn_mut(id)?.committed = true;
        self.touch();
        Ok(())
    }

    /// Append resolved media to a committed turn
    pub fn attach_media(&mut self, id: TurnId, attachment: MediaAttachment) -> Result<()> {
        let turn = self.turn_mut(id)?;
        if !turn.committed {
            return Err(AgentError::Session(format!("turn {id} is not committed")));
        }
        turn.media.push(attachment);
        self.touch();
        Ok(())
    }

    /// Message count
    pub fn message_count(&self) -> usize {
        self.conversation.len()
    }

    /// Duration since creation
    pub fn duration(&self) -> chrono::Duration {
        self.updated_at - self.created_at
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Session persistence, provided by the embedding application
pub trait SessionStore: Send + Sync {
    /// Save a session
    fn save(&self, session: &Session) -> Result<()>;

    /// Load a session by ID
    fn load(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Load a session, creating it with `system_prompt` on first reference
    fn get_or_create(&self, id: &SessionId, system_prompt: &str) -> Result<Session> {
        if let Some(session) = self.load(id)? {
            return Ok(session);
        }
        let session = Session::with_system_prompt(id.clone(), system_prompt);
        self.save(&session)?;
        Ok(session)
    }

    /// List sessions for a user, most recently active first
    fn list(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<Session>>;

    /// Attach media to an already persisted turn
    fn patch_turn(&self, id: &SessionId, turn: TurnId, attachment: MediaAttachment) -> Result<()> {
        let mut session = self
            .load(id)?
            .ok_or_else(|| AgentError::Session(format!("unknown session {id}")))?;
        session.attach_media(turn, attachment)?;
        self.save(&session)
    }
}

/// In-memory session store (for development/testing)
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.get(id).cloned())
    }

    fn list(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<_> = sessions
            .values()
            .filter(|s| user_id.is_none_or(|uid| s.metadata.user_id.as_deref() == Some(uid)))
            .cloned()
            .collect();

        // Sort by updated_at descending
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        result.truncate(limit);

        Ok(result)
    }

    fn patch_turn(&self, id: &SessionId, turn: TurnId, attachment: MediaAttachment) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AgentError::Session(format!("unknown session {id}")))?;
        session.attach_media(turn, attachment)
    }
}
