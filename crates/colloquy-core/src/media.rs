//! Inline media-intent markers
//!
//! The model may write `![SEARCH: "query"]` (images) or `![VIDEO: "query"]`
//! into its answer. Each distinct marker is resolved once, in the background,
//! and the result is both sent to the transport and patched into the stored
//! turn once that turn has been committed.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::events::{EventSink, TurnEvent};
use crate::session::{SessionId, SessionStore, TurnId};

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!\[(SEARCH|VIDEO):\s*"([^"\]]+)"\]"#).expect("media marker pattern is valid")
});

/// Kind of media a marker asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A marker found in the model's visible output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaIntent {
    pub kind: MediaKind,
    pub query: String,
    /// Exact marker text; identifies the intent
    pub placeholder: String,
}

/// One search hit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Resolved media stored on a turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub query: String,
    pub placeholder: String,
    pub results: Vec<MediaItem>,
}

/// Resolves media searches
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, kind: MediaKind, query: &str) -> Result<Vec<MediaItem>>;
}

/// All complete markers in `text`, in order of appearance
pub fn scan_markers(text: &str) -> Vec<MediaIntent> {
    MARKER
        .captures_iter(text)
        .map(|caps| MediaIntent {
            kind: if &caps[1] == "VIDEO" {
                MediaKind::Video
            } else {
                MediaKind::Image
            },
            query: caps[2].trim().to_string(),
            placeholder: caps[0].to_string(),
        })
        .collect()
}

/// Longest unterminated marker kept open across scans
const MAX_PENDING_MARKER: usize = 512;

/// Markers in newly streamed text, plus the offset the next scan resumes
/// from. Everything before the offset can no longer start a marker.
pub(crate) fn scan_pending(text: &str) -> (Vec<MediaIntent>, usize) {
    let intents = scan_markers(text);
    let end = MARKER.find_iter(text).last().map_or(0, |m| m.end());
    let tail = &text[end..];

    let resume = tail
        .match_indices("![")
        .map(|(pos, _)| pos)
        .find(|pos| tail.len() - pos <= MAX_PENDING_MARKER)
        .or_else(|| tail.ends_with('!').then(|| tail.len() - 1))
        .unwrap_or(tail.len());
    (intents, end + resume)
}

/// Handle to the background media tasks of one streamed turn.
///
/// Call [`PendingMedia::commit`] after the session has been persisted;
/// tasks hold their store patch until then. Dropping the handle without
/// committing discards the patches.
pub struct PendingMedia {
    committed: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PendingMedia {
    /// Number of resolutions scheduled during the turn
    pub fn scheduled(&self) -> usize {
        self.tasks.len()
    }

    /// Release the patch-after-commit path
    pub fn commit(self) -> MediaTasks {
        // Receivers observe the value even after the sender is dropped.
        self.committed.send_replace(true);
        MediaTasks { tasks: self.tasks }
    }
}

/// Background media tasks after commit
pub struct MediaTasks {
    tasks: Vec<JoinHandle<()>>,
}

impl MediaTasks {
    /// Wait for every resolution and patch to finish
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Media task panicked");
            }
        }
    }
}

/// Spawns one resolution task per intent
pub(crate) struct MediaDispatcher {
    resolver: Option<Arc<dyn MediaResolver>>,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn SessionStore>>,
    session_id: SessionId,
    turn_id: TurnId,
    committed: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaDispatcher {
    pub(crate) fn new(
        resolver: Option<Arc<dyn MediaResolver>>,
        sink: Arc<dyn EventSink>,
        store: Option<Arc<dyn SessionStore>>,
        session_id: SessionId,
        turn_id: TurnId,
    ) -> Self {
        let (committed, _) = watch::channel(false);
        Self {
            resolver,
            sink,
            store,
            session_id,
            turn_id,
            committed,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn dispatch(&mut self, intent: MediaIntent) {
        let Some(resolver) = self.resolver.clone() else {
            tracing::debug!(placeholder = %intent.placeholder, "No media resolver configured");
            return;
        };
        tracing::debug!(kind = %intent.kind, query = %intent.query, "Scheduling media resolution");

        let task = resolve_and_patch(
            resolver,
            intent,
            Arc::clone(&self.sink),
            self.store.clone(),
            self.session_id.clone(),
            self.turn_id,
            self.committed.subscribe(),
        );
        self.tasks.push(tokio::spawn(task));
    }

    pub(crate) fn into_pending(self) -> PendingMedia {
        PendingMedia {
            committed: self.committed,
            tasks: self.tasks,
        }
    }
}

async fn resolve_and_patch(
    resolver: Arc<dyn MediaResolver>,
    intent: MediaIntent,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn SessionStore>>,
    session_id: SessionId,
    turn_id: TurnId,
    mut committed: watch::Receiver<bool>,
) {
    let results = match resolver.resolve(intent.kind, &intent.query).await {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!(query = %intent.query, error = %e, "Media resolution failed");
            Vec::new()
        }
    };

    let attachment = MediaAttachment {
        kind: intent.kind,
        query: intent.query,
        placeholder: intent.placeholder,
        results,
    };

    let event = TurnEvent::MediaResolved {
        query: attachment.query.clone(),
        kind: attachment.kind,
        placeholder: attachment.placeholder.clone(),
        results: attachment.results.clone(),
    };
    if sink.send(event).await.is_err() {
        tracing::debug!("Transport closed before media resolved");
    }

    let Some(store) = store else {
        return;
    };
    if committed.wait_for(|c| *c).await.is_err() {
        tracing::warn!(turn = %turn_id, "Turn was never committed; discarding media patch");
        return;
    }
    if let Err(e) = store.patch_turn(&session_id, turn_id, attachment) {
        tracing::warn!(turn = %turn_id, error = %e, "Failed to patch media into stored turn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemorySessionStore, Session};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MediaResolver for CountingResolver {
        async fn resolve(&self, kind: MediaKind, query: &str) -> Result<Vec<MediaItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![MediaItem {
                title: format!("{kind}: {query}"),
                url: "https://example.com/1".into(),
                thumbnail_url: None,
                source: None,
            }])
        }
    }

    #[test]
    fn test_scan_markers() {
        let text = r#"Look: ![SEARCH: "red panda"] and ![VIDEO:"photosynthesis"] but not ![SEARCH: "open"#;
        let found = scan_markers(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, MediaKind::Image);
        assert_eq!(found[0].query, "red panda");
        assert_eq!(found[0].placeholder, r#"![SEARCH: "red panda"]"#);
        assert_eq!(found[1].kind, MediaKind::Video);
        assert_eq!(found[1].query, "photosynthesis");
    }

    #[test]
    fn test_scan_pending_resume_offset() {
        let (found, resume) = scan_pending("plain text");
        assert!(found.is_empty());
        assert_eq!(resume, 10);

        let text = r#"a ![SEARCH: "cats"] then ![VID"#;
        let (found, resume) = scan_pending(text);
        assert_eq!(found.len(), 1);
        assert_eq!(&text[resume..], "![VID");

        let (_, resume) = scan_pending("wait for it !");
        assert_eq!(resume, 12);

        let stale = format!("![SEARCH: \"{}", "x".repeat(MAX_PENDING_MARKER));
        let (_, resume) = scan_pending(&stale);
        assert_eq!(resume, stale.len());
    }

    #[tokio::test]
    async fn test_patch_waits_for_commit() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::new();
        let turn_id = session.begin_turn();
        store.save(&session).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let mut dispatcher = MediaDispatcher::new(
            Some(resolver.clone()),
            Arc::new(tx),
            Some(store.clone() as Arc<dyn SessionStore>),
            session.id.clone(),
            turn_id,
        );
        dispatcher.dispatch(scan_markers(r#"![SEARCH: "cats"]"#).remove(0));
        let pending = dispatcher.into_pending();
        assert_eq!(pending.scheduled(), 1);

        // the event arrives before commit
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TurnEvent::MediaResolved { ref query, .. } if query == "cats"));
        assert!(store.load(&session.id).unwrap().unwrap().turns[0].media.is_empty());

        session.mark_committed(turn_id).unwrap();
        store.save(&session).unwrap();
        pending.commit().join().await;

        let stored = store.load(&session.id).unwrap().unwrap();
        assert_eq!(stored.turns[0].media.len(), 1);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_turn_discards_patch() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::new();
        let turn_id = session.begin_turn();
        store.save(&session).unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let mut dispatcher = MediaDispatcher::new(
            Some(Arc::new(CountingResolver {
                calls: AtomicUsize::new(0),
            })),
            Arc::new(tx),
            Some(store.clone() as Arc<dyn SessionStore>),
            session.id.clone(),
            turn_id,
        );
        dispatcher.dispatch(scan_markers(r#"![VIDEO: "tides"]"#).remove(0));
        let PendingMedia { committed, tasks } = dispatcher.into_pending();
        drop(committed);
        for task in tasks {
            task.await.unwrap();
        }

        assert!(store.load(&session.id).unwrap().unwrap().turns[0].media.is_empty());
    }
}
