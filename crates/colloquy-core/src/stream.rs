//! Stream Decoder
//!
//! Splits a live token feed into visible text and reasoning, toggled by
//! `<think>`/`<thinking>` tag pairs, and watches the visible text for media
//! markers. No emitted delta ever contains part of a tag: a buffer tail that
//! could still grow into a tag is held back until the next token decides it.

use std::collections::HashSet;
use std::sync::Arc;

use crate::events::{EventSink, TurnEvent};
use crate::media::{MediaDispatcher, MediaIntent, scan_pending};

/// `(open, close)` reasoning tag pairs, longest first
pub const REASONING_TAGS: &[(&str, &str)] = &[("<thinking>", "</thinking>"), ("<think>", "</think>")];

/// Which channel text currently flows into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderMode {
    Normal,
    Reasoning,
}

/// Output of the decoder, in stream order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedEvent {
    Text(String),
    ReasoningStart,
    Reasoning(String),
    ReasoningEnd,
    /// First sighting of a distinct media marker
    MediaIntent(MediaIntent),
}

/// Incremental reasoning/text splitter
#[derive(Debug)]
pub struct StreamDecoder {
    mode: DecoderMode,
    /// Closing tag of the pair that opened the current reasoning block
    closing: &'static str,
    buffer: String,
    visible: String,
    /// Offset into `visible` where the next marker scan starts
    scanned: usize,
    dispatched: HashSet<String>,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            mode: DecoderMode::Normal,
            closing: "",
            buffer: String::new(),
            visible: String::new(),
            scanned: 0,
            dispatched: HashSet::new(),
        }
    }

    pub const fn mode(&self) -> DecoderMode {
        self.mode
    }

    /// Visible text emitted so far
    pub fn visible_text(&self) -> &str {
        &self.visible
    }

    /// Text currently held back
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Tags that can change the mode from here, longest first
    fn candidates(&self) -> Vec<&'static str> {
        match self.mode {
            DecoderMode::Normal => REASONING_TAGS.iter().map(|(open, _)| *open).collect(),
            DecoderMode::Reasoning => vec![self.closing],
        }
    }

    /// Feed one token and drain whatever can be decided
    pub fn feed(&mut self, token: &str) -> Vec<DecodedEvent> {
        self.buffer.push_str(token);
        let mut events = Vec::new();

        while !self.buffer.is_empty() {
            let candidates = self.candidates();

            if let Some(tag) = candidates.iter().find(|t| self.buffer.starts_with(**t)) {
                self.buffer.drain(..tag.len());
                self.toggle(tag, &mut events);
                continue;
            }

            if let Some(pos) = candidates.iter().filter_map(|t| self.buffer.find(t)).min() {
                let head: String = self.buffer.drain(..pos).collect();
                self.emit(head, &mut events);
                continue;
            }

            let hold = held_suffix_len(&self.buffer, &candidates);
            let emit_len = self.buffer.len() - hold;
            if emit_len > 0 {
                let head: String = self.buffer.drain(..emit_len).collect();
                self.emit(head, &mut events);
            }
            break;
        }

        events
    }

    /// Flush held-back text at the end of a model call. An unterminated
    /// reasoning block is closed.
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        self.emit(rest, &mut events);
        if self.mode == DecoderMode::Reasoning {
            self.mode = DecoderMode::Normal;
            self.closing = "";
            events.push(DecodedEvent::ReasoningEnd);
        }
        events
    }

    fn toggle(&mut self, tag: &str, events: &mut Vec<DecodedEvent>) {
        match self.mode {
            DecoderMode::Normal => {
                self.closing = REASONING_TAGS
                    .iter()
                    .find(|(open, _)| *open == tag)
                    .map_or("", |(_, close)| *close);
                self.mode = DecoderMode::Reasoning;
                events.push(DecodedEvent::ReasoningStart);
            }
            DecoderMode::Reasoning => {
                self.closing = "";
                self.mode = DecoderMode::Normal;
                events.push(DecodedEvent::ReasoningEnd);
            }
        }
    }

    fn emit(&mut self, text: String, events: &mut Vec<DecodedEvent>) {
        if text.is_empty() {
            return;
        }
        match self.mode {
            DecoderMode::Reasoning => events.push(DecodedEvent::Reasoning(text)),
            DecoderMode::Normal => {
                self.visible.push_str(&text);
                events.push(DecodedEvent::Text(text));
                let (intents, resume) = scan_pending(&self.visible[self.scanned..]);
                self.scanned += resume;
                for intent in intents {
                    if self.dispatched.insert(intent.placeholder.clone()) {
                        events.push(DecodedEvent::MediaIntent(intent));
                    }
                }
            }
        }
    }
}

/// Length of the longest buffer suffix that is a strict prefix of a tag
fn held_suffix_len(buffer: &str, tags: &[&str]) -> usize {
    let longest = tags.iter().map(|t| t.len()).max().unwrap_or(0);
    let max_hold = longest.saturating_sub(1).min(buffer.len());
    (1..=max_hold)
        .rev()
        .find(|&k| {
            let start = buffer.len() - k;
            buffer.is_char_boundary(start)
                && tags
                    .iter()
                    .any(|t| t.len() > k && t.starts_with(&buffer[start..]))
        })
        .unwrap_or(0)
}

/// Separate a complete reply into `(visible, reasoning)` text
pub fn split_reasoning(text: &str) -> (String, String) {
    let mut decoder = StreamDecoder::new();
    let mut events = decoder.feed(text);
    events.extend(decoder.finish());

    let reasoning = events
        .into_iter()
        .filter_map(|e| match e {
            DecodedEvent::Reasoning(r) => Some(r),
            _ => None,
        })
        .collect();
    (decoder.visible, reasoning)
}

/// Drives a [`StreamDecoder`] into an [`EventSink`].
///
/// The first failed send closes the relay; later tokens are dropped, not
/// buffered.
pub(crate) struct StreamRelay {
    decoder: StreamDecoder,
    sink: Arc<dyn EventSink>,
    media: MediaDispatcher,
    open: bool,
}

impl StreamRelay {
    pub(crate) fn new(sink: Arc<dyn EventSink>, media: MediaDispatcher) -> Self {
        Self {
            decoder: StreamDecoder::new(),
            sink,
            media,
            open: true,
        }
    }

    pub(crate) const fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) async fn push_token(&mut self, token: &str) {
        if !self.open {
            return;
        }
        let events = self.decoder.feed(token);
        self.relay(events).await;
    }

    /// End of one model call; the decoder is reset even after the transport closed
    pub(crate) async fn finish_call(&mut self) {
        let events = self.decoder.finish();
        if self.open {
            self.relay(events).await;
        }
    }

    async fn relay(&mut self, events: Vec<DecodedEvent>) {
        for event in events {
            let turn_event = match event {
                DecodedEvent::MediaIntent(intent) => {
                    self.media.dispatch(intent);
                    continue;
                }
                DecodedEvent::Text(content) => TurnEvent::Token { content },
                DecodedEvent::ReasoningStart => TurnEvent::ThinkingStart,
                DecodedEvent::Reasoning(content) => TurnEvent::ThinkingDelta { content },
                DecodedEvent::ReasoningEnd => TurnEvent::ThinkingEnd,
            };
            if !self.send(turn_event).await {
                return;
            }
        }
    }

    /// Send one event; false once the transport is gone
    pub(crate) async fn send(&mut self, event: TurnEvent) -> bool {
        if !self.open {
            return false;
        }
        if self.sink.send(event).await.is_err() {
            tracing::debug!("Transport closed; dropping the rest of the stream");
            self.open = false;
        }
        self.open
    }

    pub(crate) fn into_media(self) -> MediaDispatcher {
        self.media
    }
}
